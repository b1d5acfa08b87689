mod report;
mod value;

pub use report::{
    IngestionLogEntry, LoadResult, LoadStatus, ValidationReport, Watermark, epoch,
};
pub use value::{SourceRow, Value, format_number, parse_timestamp};
