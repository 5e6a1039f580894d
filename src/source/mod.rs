//! Extraction capability: what to fetch and how to read it
//!
//! The pipeline never looks inside a response body. A [`ListingSource`] knows
//! how to ask for the total and for one page and how to turn a page body into
//! records; a [`DetailExtractor`] turns a detail page into one record and a
//! stored detail record into attachment descriptors.
//!
//! Parsing is synchronous and never retried. A body that cannot be parsed at
//! all is an [`ExtractError`]; a single bad row inside an otherwise valid page
//! is reported in [`ParsedPage::rejected`] and the rest of the page survives.
//!
//! [`ContractListing`] and [`ContractDetail`] implement both capabilities for
//! the government contract publication site.

mod contract_publication;

pub use contract_publication::{ContractDetail, ContractListing};

use crate::error::ExtractError;
use crate::types::{AttachmentDescriptor, FetchTarget, Phase, Record};

/// Separator used when a list is stored in a single cell
pub const LIST_SEPARATOR: &str = ", ";

/// Records of one listing page
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedPage {
    /// Rows that parsed
    pub records: Vec<Record>,
    /// Rows that did not, with the reason
    pub rejected: Vec<ExtractError>,
}

impl ParsedPage {
    /// Whether the page carried no rows at all, good or bad
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.rejected.is_empty()
    }
}

/// Paged list endpoint
pub trait ListingSource: Send + Sync {
    /// Count query, `None` when the source has no count endpoint
    fn count_target(&self) -> Option<FetchTarget>;

    /// Total number of records from a count response
    fn parse_count(&self, body: &[u8]) -> Result<u64, ExtractError>;

    /// Target of 1-based page `page`
    fn page_target(&self, page: u32) -> FetchTarget;

    /// Whether `target` is a page (as opposed to the count query)
    fn is_page_target(&self, target: &FetchTarget) -> bool;

    /// Rows of a page response
    fn parse_page(&self, body: &[u8]) -> Result<ParsedPage, ExtractError>;

    /// Field holding the date records are partitioned by
    fn date_field(&self) -> &str;

    /// Field holding the detail page link
    fn link_field(&self) -> &str;
}

/// Detail pages and the attachments they link to
pub trait DetailExtractor: Send + Sync {
    /// Target of the detail page at `link`
    fn detail_target(&self, link: &str) -> FetchTarget {
        FetchTarget::new(Phase::Detail, link)
    }

    /// Extract the record of the detail page fetched from `url`
    fn parse(&self, url: &str, body: &[u8]) -> Result<Record, ExtractError>;

    /// Field holding the date detail records are partitioned by
    fn date_field(&self) -> &str;

    /// Attachments of a stored detail record, destined for folder `period`
    fn attachments(&self, detail: &Record, period: &str) -> Vec<AttachmentDescriptor>;
}

/// Join a list into one cell
pub fn join_list<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR)
}

/// Split a cell written by [`join_list`], skipping blanks
pub fn split_list(cell: &str) -> Vec<String> {
    cell.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Make `name` safe to use as a single path component
///
/// Separators, reserved characters and control characters become `_`; leading
/// and trailing dots and whitespace are removed.
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}
