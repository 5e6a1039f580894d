//! Government contract publication site
//!
//! Listing: form POSTs to a count endpoint (bare integer body) and a page
//! endpoint (`{"rows": [...]}`), filtered by publication date on the server.
//! Detail: an HTML page whose `div.content_2020` holds one labelled paragraph
//! per field (`label：value`) and a `li.fileInfo` per attachment.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use super::{DetailExtractor, ListingSource, ParsedPage, join_list, sanitize_file_name, split_list};
use crate::config::{DateRange, SourceConfig};
use crate::error::{Error, ExtractError, Result};
use crate::http::ENDPOINT_PARAM;
use crate::types::{AttachmentDescriptor, FetchTarget, Phase, Record};

const COUNT_ID: &str = "count";
const PAGE_PARAM: &str = "currentPage";

/// Listing row key → record field, in column order
const LISTING_FIELDS: [(&str, &str); 7] = [
    ("signDate", "sign_date"),
    ("publishDate", "publish_date"),
    ("purchaserName", "purchaser"),
    ("supplyName", "supplier"),
    ("agentName", "agent"),
    ("projName", "project_name"),
    ("contractName", "contract_name"),
];

const PUBLISH_DATE: &str = "publish_date";
const CONTRACT_LINK: &str = "contract_link";

/// Detail label → record field; the index picks the n-th paragraph with that label
const DETAIL_FIELDS: [(&str, &str, usize); 19] = [
    ("合同编号", "contract_number", 0),
    ("合同名称", "contract_name", 0),
    ("项目编号", "project_number", 0),
    ("项目名称", "project_name", 0),
    ("采购人（甲方）", "purchaser", 0),
    ("地址", "purchaser_address", 0),
    ("联系方式", "purchaser_contact", 0),
    ("供应商（乙方）", "supplier", 0),
    ("地址", "supplier_address", 1),
    ("联系方式", "supplier_contact", 1),
    ("主要标的名称", "main_product_name", 0),
    ("规格型号（或服务要求）", "specifications", 0),
    ("主要标的数量", "quantity", 0),
    ("主要标的单价", "unit_price", 0),
    ("合同金额", "contract_amount", 0),
    ("履约期限、地点等简要信息", "performance_location", 0),
    ("采购方式", "procurement_method", 0),
    ("合同签订日期", "contract_sign_date", 0),
    ("合同公告日期", "contract_announcement_date", 0),
];

const CONTRACT_NUMBER: &str = "contract_number";
const CONTRACT_NAME: &str = "contract_name";
const ANNOUNCEMENT_DATE: &str = "contract_announcement_date";
const ATTACHMENT_NAMES: &str = "attachment_names";
const ATTACHMENT_URLS: &str = "attachment_urls";
const DETAIL_URL: &str = "detail_url";

/// Paged contract listing of one publication date range
#[derive(Clone, Debug)]
pub struct ContractListing {
    listing_url: String,
    count_url: Option<String>,
    detail_url_template: String,
    form: Vec<(String, String)>,
}

impl ContractListing {
    /// Listing of contracts published in `range`
    pub fn new(config: &SourceConfig, range: DateRange) -> Self {
        let mut form: Vec<(String, String)> = config
            .form
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        form.push((
            "searchPlacardStartDate".into(),
            range.start().format("%Y-%m-%d").to_string(),
        ));
        form.push((
            "searchPlacardEndDate".into(),
            range.end().format("%Y-%m-%d").to_string(),
        ));
        Self {
            listing_url: config.listing_url.clone(),
            count_url: config.count_url.clone(),
            detail_url_template: config.detail_url_template.clone(),
            form,
        }
    }

    fn form_target(&self, identifier: String, endpoint: &str, page: u32) -> FetchTarget {
        FetchTarget::new(Phase::Listing, identifier)
            .with_params(self.form.iter().cloned())
            .with_params([
                (ENDPOINT_PARAM.to_string(), endpoint.to_string()),
                (PAGE_PARAM.to_string(), page.to_string()),
            ])
    }

    fn row_record(&self, row: &Value) -> std::result::Result<Record, ExtractError> {
        let object = row
            .as_object()
            .ok_or_else(|| ExtractError::InvalidPayload("row is not an object".into()))?;
        let uuid = object
            .get("uuid")
            .map(json_text)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ExtractError::MissingField("uuid".into()))?;

        let mut record = Record::new();
        for (source_key, field) in LISTING_FIELDS {
            record.insert(field, object.get(source_key).map(json_text).unwrap_or_default());
        }
        record.insert(CONTRACT_LINK, self.detail_url_template.replace("{uuid}", &uuid));
        Ok(record)
    }
}

impl ListingSource for ContractListing {
    fn count_target(&self) -> Option<FetchTarget> {
        let url = self.count_url.as_deref()?;
        Some(self.form_target(COUNT_ID.to_string(), url, 0))
    }

    fn parse_count(&self, body: &[u8]) -> std::result::Result<u64, ExtractError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ExtractError::InvalidPayload(format!("count is not JSON: {e}")))?;
        let count = match &value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        count.ok_or_else(|| ExtractError::InvalidPayload(format!("count is not a number: {value}")))
    }

    fn page_target(&self, page: u32) -> FetchTarget {
        self.form_target(format!("page:{page}"), &self.listing_url, page)
    }

    fn is_page_target(&self, target: &FetchTarget) -> bool {
        target.phase() == Phase::Listing && target.identifier() != COUNT_ID
    }

    fn parse_page(&self, body: &[u8]) -> std::result::Result<ParsedPage, ExtractError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ExtractError::InvalidPayload(format!("page is not JSON: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| ExtractError::InvalidPayload("page is not a JSON object".into()))?;
        let rows = match object.get("rows") {
            None | Some(Value::Null) => return Ok(ParsedPage::default()),
            Some(Value::Array(rows)) => rows,
            Some(_) => return Err(ExtractError::InvalidPayload("'rows' is not an array".into())),
        };

        let mut page = ParsedPage::default();
        for row in rows {
            match self.row_record(row) {
                Ok(record) => page.records.push(record),
                Err(e) => page.rejected.push(e),
            }
        }
        Ok(page)
    }

    fn date_field(&self) -> &str {
        PUBLISH_DATE
    }

    fn link_field(&self) -> &str {
        CONTRACT_LINK
    }
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Contract detail pages
#[derive(Clone, Debug)]
pub struct ContractDetail {
    attachment_url_template: String,
    attach_id: Regex,
}

impl ContractDetail {
    /// Extractor building attachment URLs from `config.attachment_url_template`
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let attach_id = Regex::new(r"downloadAttachFile\(\s*'([^']+)'")
            .map_err(|e| Error::Other(format!("attachment pattern: {e}")))?;
        Ok(Self {
            attachment_url_template: config.attachment_url_template.clone(),
            attach_id,
        })
    }
}

impl DetailExtractor for ContractDetail {
    fn parse(&self, url: &str, body: &[u8]) -> std::result::Result<Record, ExtractError> {
        let html = String::from_utf8_lossy(body);
        let doc = Html::parse_document(&html);

        let content_selector = create_selector("div.content_2020")?;
        let paragraph_selector = create_selector("p")?;
        let name_selector = create_selector("li.fileInfo div b")?;
        let link_selector = create_selector("li.fileInfo a[onclick]")?;

        let content = doc
            .select(&content_selector)
            .next()
            .ok_or_else(|| ExtractError::InvalidPayload("no contract content block".into()))?;

        let paragraphs: Vec<(String, String)> = content
            .select(&paragraph_selector)
            .filter_map(|p| split_label(&element_text(p)))
            .collect();

        let mut record = Record::new();
        for (label, field, nth) in DETAIL_FIELDS {
            let value = paragraphs
                .iter()
                .filter(|(l, _)| l.contains(label))
                .nth(nth)
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            let value = if field == "main_product_name" {
                value.replace(';', "")
            } else {
                value
            };
            record.insert(field, value);
        }

        let names: Vec<String> = content
            .select(&name_selector)
            .map(element_text)
            .filter(|n| !n.is_empty())
            .collect();
        let urls: Vec<String> = content
            .select(&link_selector)
            .filter_map(|a| a.value().attr("onclick"))
            .filter_map(|onclick| self.attach_id.captures(onclick))
            .filter_map(|caps| caps.get(1))
            .map(|id| self.attachment_url_template.replace("{id}", id.as_str()))
            .collect();
        record.insert(ATTACHMENT_NAMES, join_list(&names));
        record.insert(ATTACHMENT_URLS, join_list(&urls));
        record.insert(DETAIL_URL, url);
        Ok(record)
    }

    fn date_field(&self) -> &str {
        ANNOUNCEMENT_DATE
    }

    fn attachments(&self, detail: &Record, period: &str) -> Vec<AttachmentDescriptor> {
        let number = detail.get(CONTRACT_NUMBER).unwrap_or_default();
        let name = detail.get(CONTRACT_NAME).unwrap_or_default();
        split_list(detail.get(ATTACHMENT_URLS).unwrap_or_default())
            .into_iter()
            .enumerate()
            .map(|(idx, url)| AttachmentDescriptor {
                period: period.to_string(),
                file_name: sanitize_file_name(&format!("{number}_{name}_{}.pdf", idx + 1)),
                url,
            })
            .collect()
    }
}

fn create_selector(selector: &str) -> std::result::Result<Selector, ExtractError> {
    Selector::parse(selector)
        .map_err(|_| ExtractError::InvalidPayload(format!("bad selector '{selector}'")))
}

/// Text of an element with runs of whitespace collapsed
fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split `label：value`; the label is returned without whitespace
fn split_label(text: &str) -> Option<(String, String)> {
    let (label, value) = text.split_once('：')?;
    let label: String = label.chars().filter(|c| !c.is_whitespace()).collect();
    Some((label, value.trim().to_string()))
}
