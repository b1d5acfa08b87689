use super::{
    CategoryRule, ColumnSpec, ColumnType, ConditionalRule, DEFAULT_CHANGE_COLUMN, DateWindowRule,
    INGESTED_AT_COLUMN, RangeRule, ReferenceRule, SOURCE_FILE_COLUMN, SourceRules, UniqueKeyRule,
};
use chrono::{TimeZone, Utc};
use common::{Error, Result};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

fn default_change_column() -> String {
    DEFAULT_CHANGE_COLUMN.to_string()
}

/// One incremental pipeline: relational `source_table` into `bronze_table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub pipeline_id: String,
    pub source_name: String,
    pub source_table: String,
    pub bronze_table: String,
    #[serde(default = "default_change_column")]
    pub change_column: String,
    #[serde(default)]
    pub required_columns: Vec<String>,
    #[serde(default)]
    pub downstream_pipeline_id: Option<String>,
}

impl PipelineDefinition {
    fn standard(source: &str, required_columns: &[&str]) -> Self {
        Self {
            pipeline_id: format!("etl_{}_pg_to_bronze", source),
            source_name: source.to_string(),
            source_table: source.to_string(),
            bronze_table: format!("{}_raw", source),
            change_column: default_change_column(),
            required_columns: required_columns.iter().map(|c| c.to_string()).collect(),
            downstream_pipeline_id: Some(format!("silver_{}_transform", source)),
        }
    }

    /// Rules applied to extracted batches. Only presence of the declared
    /// columns and a populated change column are enforced; the typed schema
    /// of the source (plus lineage columns) shapes the bronze file.
    pub fn extract_rules(&self, base: Option<&SourceRules>) -> SourceRules {
        let mut columns = base.map(|b| b.columns.clone()).unwrap_or_else(|| {
            self.required_columns
                .iter()
                .map(|c| ColumnSpec::new(c, ColumnType::Text))
                .collect()
        });
        for (name, kind) in [
            (self.change_column.as_str(), ColumnType::Timestamp),
            (INGESTED_AT_COLUMN, ColumnType::Timestamp),
            (SOURCE_FILE_COLUMN, ColumnType::Text),
        ] {
            if !columns.iter().any(|c| c.name == name) {
                columns.push(ColumnSpec::new(name, kind));
            }
        }

        let mut rules = SourceRules::new(&self.source_name, columns);
        rules.table = Some(self.source_table.clone());
        rules.change_column = Some(self.change_column.clone());
        rules.required_columns = self.required_columns.clone();
        rules.required_fields = vec![self.change_column.clone()];
        rules
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    sources: Vec<SourceRules>,
    #[serde(default)]
    pipelines: Vec<PipelineDefinition>,
}

/// Registry of source rule sets and pipeline definitions.
#[derive(Debug, Clone, Default)]
pub struct SourceCatalog {
    sources: BTreeMap<String, SourceRules>,
    pipelines: BTreeMap<String, PipelineDefinition>,
}

impl SourceCatalog {
    pub fn builtin() -> Self {
        let mut catalog = Self::default();
        for rules in [loans(), payments(), calls(), messages(), crm(), tts()] {
            catalog.add_source(rules);
        }
        for pipeline in [
            PipelineDefinition::standard(
                "loans",
                &["loan_id", "borrower_id", "principal_amount", "disbursement_date", "updated_at"],
            ),
            PipelineDefinition::standard(
                "payments",
                &["payment_id", "loan_id", "amount", "payment_date", "updated_at"],
            ),
            PipelineDefinition::standard(
                "calls",
                &["call_id", "loan_id", "agent_id", "call_start_time", "updated_at"],
            ),
            PipelineDefinition::standard(
                "messages",
                &["message_id", "customer_id", "channel", "sent_time", "updated_at"],
            ),
            PipelineDefinition::standard(
                "crm",
                &["customer_id", "name", "phone_number", "updated_at"],
            ),
        ] {
            catalog.add_pipeline(pipeline);
        }
        catalog
    }

    /// Built-in catalog with the definitions in `path` merged over it.
    /// Entries with an existing name replace the built-in one.
    pub fn with_file(path: &str) -> Result<Self> {
        let mut catalog = Self::builtin();
        let file: CatalogFile = Config::builder()
            .add_source(File::with_name(path))
            .build()?
            .try_deserialize()?;

        info!(
            path,
            sources = file.sources.len(),
            pipelines = file.pipelines.len(),
            "Loaded source definitions"
        );
        for rules in file.sources {
            catalog.add_source(rules);
        }
        for pipeline in file.pipelines {
            catalog.add_pipeline(pipeline);
        }
        Ok(catalog)
    }

    pub fn add_source(&mut self, rules: SourceRules) {
        debug!(source = %rules.name, "Registering source rules");
        self.sources.insert(rules.name.clone(), rules);
    }

    pub fn add_pipeline(&mut self, pipeline: PipelineDefinition) {
        self.pipelines.insert(pipeline.pipeline_id.clone(), pipeline);
    }

    pub fn source(&self, name: &str) -> Result<&SourceRules> {
        self.sources
            .get(name)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown source: {}", name)))
    }

    pub fn pipeline(&self, pipeline_id: &str) -> Result<&PipelineDefinition> {
        self.pipelines
            .get(pipeline_id)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown pipeline: {}", pipeline_id)))
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &PipelineDefinition> {
        self.pipelines.values()
    }

    pub fn source_names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Extraction rules for a pipeline, typed by its source's rule set when
    /// one is registered.
    pub fn extract_rules(&self, pipeline: &PipelineDefinition) -> SourceRules {
        pipeline.extract_rules(self.sources.get(&pipeline.source_name))
    }
}

fn text(name: &str) -> ColumnSpec {
    ColumnSpec::new(name, ColumnType::Text)
}

fn float(name: &str) -> ColumnSpec {
    ColumnSpec::new(name, ColumnType::Float)
}

fn timestamp(name: &str) -> ColumnSpec {
    ColumnSpec::new(name, ColumnType::Timestamp)
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn positive(column: &str) -> RangeRule {
    RangeRule {
        column: column.to_string(),
        min: Some(0.0),
        max: None,
        exclusive_min: true,
        required: true,
    }
}

fn category(column: &str, allowed: &[&str], allow_null: bool) -> CategoryRule {
    CategoryRule {
        column: column.to_string(),
        allowed: strings(allowed),
        allow_null,
    }
}

fn loan_reference(column: &str) -> ReferenceRule {
    ReferenceRule {
        column: column.to_string(),
        table: "loans".to_string(),
        key_column: "loan_id".to_string(),
    }
}

fn unique(column: &str, hard: bool) -> Option<UniqueKeyRule> {
    Some(UniqueKeyRule {
        column: column.to_string(),
        hard,
    })
}

fn loans() -> SourceRules {
    let mut rules = SourceRules::new(
        "loans",
        vec![
            text("loan_id").alias("LoanID").alias("loanid"),
            text("borrower_id")
                .alias("BorrowerID")
                .alias("CustomerID")
                .alias("customer_id"),
            text("phone_number").alias("PhoneNumber").alias("phone"),
            float("principal_amount")
                .alias("Amt")
                .alias("Principal")
                .alias("loan_amount"),
            float("interest_rate").alias("InterestRate"),
            timestamp("disbursement_date").alias("DisbursementDate"),
            text("loan_status").alias("LoanStatus"),
            timestamp("updated_at"),
        ],
    );
    let required = ["loan_id", "borrower_id", "principal_amount", "disbursement_date"];
    rules.required_columns = strings(&required);
    rules.required_fields = strings(&required);
    rules.optional_fields = strings(&["phone_number"]);
    rules.ranges = vec![
        positive("principal_amount"),
        RangeRule {
            column: "interest_rate".to_string(),
            min: Some(0.0),
            max: Some(100.0),
            exclusive_min: false,
            required: false,
        },
    ];
    rules.date_windows = vec![DateWindowRule {
        column: "disbursement_date".to_string(),
        not_before: Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).single(),
        reject_future: true,
    }];
    rules.categories = vec![category(
        "loan_status",
        &["ACTIVE", "CLOSED", "NPA", "WRITTEN_OFF"],
        false,
    )];
    rules.unique_key = unique("loan_id", true);
    rules
}

fn payments() -> SourceRules {
    let mut rules = SourceRules::new(
        "payments",
        vec![
            text("payment_id").alias("PaymentID"),
            text("loan_id").alias("LoanID"),
            float("amount").alias("Amount").alias("payment_amount"),
            timestamp("payment_date").alias("PaymentDate"),
            text("payment_mode").alias("PaymentMode").alias("mode"),
            text("payment_status").alias("PaymentStatus").alias("status"),
            timestamp("updated_at"),
        ],
    );
    let required = ["payment_id", "loan_id", "amount", "payment_date"];
    rules.required_columns = strings(&required);
    rules.required_fields = strings(&required);
    rules.ranges = vec![positive("amount")];
    rules.date_windows = vec![DateWindowRule {
        column: "payment_date".to_string(),
        not_before: None,
        reject_future: true,
    }];
    rules.categories = vec![category(
        "payment_status",
        &["SUCCESS", "FAILED", "PENDING", "REVERSED"],
        true,
    )];
    rules.references = vec![loan_reference("loan_id")];
    rules.unique_key = unique("payment_id", true);
    rules
}

fn calls() -> SourceRules {
    let mut rules = SourceRules::new(
        "calls",
        vec![
            text("call_id").alias("CallID"),
            text("loan_id").alias("LoanID"),
            text("agent_id").alias("AgentID"),
            timestamp("call_start_time").alias("CallStartTime"),
            float("call_duration_sec").alias("duration_seconds"),
            text("transcript").alias("Transcript"),
            text("call_status").alias("CallStatus"),
            timestamp("updated_at"),
        ],
    );
    let required = ["call_id", "loan_id", "agent_id", "call_start_time"];
    rules.required_columns = strings(&required);
    rules.required_fields = strings(&required);
    rules.ranges = vec![RangeRule {
        column: "call_duration_sec".to_string(),
        min: Some(0.0),
        max: Some(7200.0),
        exclusive_min: false,
        required: true,
    }];
    rules.conditionals = vec![ConditionalRule {
        when_column: "call_status".to_string(),
        equals: "COMPLETED".to_string(),
        require_column: "transcript".to_string(),
    }];
    rules.references = vec![loan_reference("loan_id")];
    rules.unique_key = unique("call_id", false);
    rules
}

fn messages() -> SourceRules {
    let mut rules = SourceRules::new(
        "messages",
        vec![
            text("message_id").alias("MessageID").alias("sms_id"),
            text("customer_id").alias("CustomerID"),
            text("channel").alias("Channel"),
            text("message_text").alias("body").alias("content"),
            timestamp("sent_time").alias("SentTime").alias("sent_at"),
            text("delivery_status").alias("DeliveryStatus").alias("status"),
            timestamp("updated_at"),
        ],
    );
    let required = ["message_id", "customer_id", "channel", "sent_time"];
    rules.required_columns = strings(&required);
    rules.required_fields = strings(&required);
    rules.categories = vec![
        category("channel", &["SMS", "WHATSAPP"], false),
        category(
            "delivery_status",
            &["SENT", "DELIVERED", "FAILED", "READ"],
            true,
        ),
    ];
    rules.unique_key = unique("message_id", false);
    rules
}

fn crm() -> SourceRules {
    let mut rules = SourceRules::new(
        "crm",
        vec![
            text("customer_id").alias("CustomerID"),
            text("name").alias("customer_name").alias("Name"),
            text("phone_number").alias("phone").alias("PhoneNumber"),
            text("email").alias("Email"),
            text("address").alias("Address"),
            timestamp("updated_at"),
        ],
    );
    rules.required_columns = strings(&["customer_id", "name", "phone_number"]);
    rules.required_fields = strings(&["customer_id", "name"]);
    rules.optional_fields = strings(&["phone_number", "email"]);
    rules.unique_key = unique("customer_id", true);
    rules
}

fn tts() -> SourceRules {
    let mut rules = SourceRules::new(
        "tts",
        vec![
            text("tts_id").alias("TTSID"),
            text("customer_id").alias("CustomerID"),
            text("message").alias("Message"),
            text("delivery_time").alias("DeliveryTime"),
            text("status").alias("Status"),
        ],
    );
    rules.change_column = None;
    let required = ["tts_id", "customer_id", "delivery_time", "status"];
    rules.required_columns = strings(&required);
    rules.required_fields = strings(&required);
    rules.unique_key = unique("tts_id", false);
    rules
}
