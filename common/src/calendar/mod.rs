// Calendar retrieval and event extraction

pub mod extractor;
pub mod fetcher;
pub mod ics;

pub use extractor::{extract, extract_with_issues, parse_summary, Extraction, ExtractionContext, SummaryParts};
pub use fetcher::{semester_for, CalendarFetcher, CalendarSource};
