//! End-to-end runs of the three phases against an in-memory site.

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use contract_harvest::config::SourceConfig;
use contract_harvest::identity::RotatingIdentity;
use contract_harvest::source::{ContractDetail, ContractListing};
use contract_harvest::store::{TabularStore, TabularTarget};
use contract_harvest::{
    Config, DateRange, FetchError, FetchResponse, FetchTarget, Fetcher, Harvester, Identity, Phase,
};

const SITE: &str = "http://site.test";

/// Serves canned responses by target identifier; anything unknown is a 404
#[derive(Default)]
struct Site {
    pages: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    requests: Mutex<Vec<String>>,
}

impl Site {
    fn serve(&self, identifier: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.pages
            .lock()
            .unwrap()
            .insert(identifier.to_string(), (status, body.into()));
    }

    fn requests_for(&self, identifier: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| *r == identifier)
            .count()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for Site {
    async fn fetch(&self, target: &FetchTarget, _identity: &Identity) -> Result<FetchResponse, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push(target.identifier().to_string());
        let page = self.pages.lock().unwrap().get(target.identifier()).cloned();
        Ok(match page {
            Some((status, body)) => FetchResponse::new(status, body),
            None => FetchResponse::new(404, Vec::new()),
        })
    }
}

fn listing_row(uuid: &str, published: &str, name: &str) -> String {
    format!(
        r#"{{"uuid": "{uuid}", "signDate": "2023-11-01", "publishDate": "{published}",
            "purchaserName": "City Transport Bureau", "supplyName": "Road Co",
            "agentName": "", "projName": "Road works", "contractName": "{name}"}}"#
    )
}

fn detail_html(number: &str, name: &str, announced: &str, files: &[&str]) -> String {
    let items: String = files
        .iter()
        .map(|id| {
            format!(
                r#"<li class="fileInfo"><div><b>{id}.pdf</b></div><a onclick="downloadAttachFile('{id}','{id}.pdf')">下载</a></li>"#
            )
        })
        .collect();
    format!(
        r#"<html><body><div class="content_2020">
            <p>合同编号：{number}</p>
            <p>合同名称：{name}</p>
            <p>合同公告日期：{announced}</p>
            <ul>{items}</ul>
        </div></body></html>"#
    )
}

struct Fixture {
    dir: TempDir,
    site: Arc<Site>,
    config: Config,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.source = SourceConfig {
            detail_url_template: format!("{SITE}/detail/{{uuid}}"),
            attachment_url_template: format!("{SITE}/file/{{id}}"),
            ..SourceConfig::default()
        };
        config.output.listing_dir = dir.path().join("listing");
        config.output.detail_dir = dir.path().join("detail");
        config.output.attachment_dir = dir.path().join("attachments");
        config.output.ledger_dir = dir.path().join("failures");
        config.page_size = 2;
        for phase in Phase::ALL {
            let settings = config.phase_mut(phase);
            settings.start_date = "2023-11-01".into();
            settings.end_date = "2023-11-06".into();
            settings.concurrency = 3;
            settings.retry.max_attempts = 2;
            settings.retry.initial_delay = Duration::from_millis(1);
            settings.retry.max_delay = Duration::from_millis(1);
        }

        let site = Arc::new(Site::default());
        site.serve("count", 200, "4");
        site.serve(
            "page:1",
            200,
            format!(
                r#"{{"rows": [{}, {}]}}"#,
                listing_row("u-1", "2023-11-03 10:00:00", "Road repair"),
                listing_row("u-2", "2023-11-04", "Bridge paint")
            ),
        );
        site.serve(
            "page:2",
            200,
            format!(
                r#"{{"rows": [{}, {}]}}"#,
                listing_row("u-2", "2023-11-04", "Bridge paint"),
                listing_row("u-3", "2023-11-06", "Too late")
            ),
        );
        site.serve(
            &format!("{SITE}/detail/u-1"),
            200,
            detail_html("HT-1", "Road repair", "2023-11-03", &["F001", "F002"]),
        );
        site.serve(
            &format!("{SITE}/detail/u-2"),
            200,
            detail_html("HT-2", "Bridge paint", "2023-11-04", &["F003"]),
        );
        site.serve(&format!("{SITE}/file/F001"), 200, "%PDF-1");
        site.serve(&format!("{SITE}/file/F002"), 200, "%PDF-2");
        site.serve(&format!("{SITE}/file/F003"), 500, "upstream broke");

        Self { dir, site, config }
    }

    fn harvester(&self, cancel: CancellationToken) -> Harvester {
        let range = self.config.listing.date_range(Phase::Listing).unwrap();
        Harvester::new(
            self.config.clone(),
            self.site.clone(),
            Arc::new(RotatingIdentity::new(None, vec!["harvest-test/1.0".into()])),
            Arc::new(ContractListing::new(&self.config.source, range)),
            Arc::new(ContractDetail::new(&self.config.source).unwrap()),
            cancel,
        )
        .unwrap()
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }
}

async fn sheet_rows(workbook: &Path, sheet: &str) -> usize {
    TabularStore::new()
        .read(&TabularTarget::new(workbook, sheet))
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn phases_chain_through_the_filesystem() {
    let fx = Fixture::new();
    let harvester = fx.harvester(CancellationToken::new());

    let listing = harvester.run(Phase::Listing).await.unwrap();
    assert_eq!(listing.targets, 2);
    assert_eq!(listing.records_emitted, 4);
    assert_eq!(listing.records_written, 3);
    assert_eq!(listing.drops["out_of_range"], 1);
    assert!(!listing.is_degraded());
    assert_eq!(sheet_rows(&fx.path("listing/2023-11/2023-11-03"), "Contracts").await, 1);
    assert_eq!(sheet_rows(&fx.path("listing/2023-11/2023-11-04"), "Contracts").await, 2);
    assert!(!fx.path("listing/2023-11/2023-11-06").exists());

    let detail = harvester.run(Phase::Detail).await.unwrap();
    assert_eq!(detail.targets, 2, "duplicate listing rows share one detail fetch");
    assert_eq!(detail.records_written, 2);
    assert_eq!(fx.site.requests_for(&format!("{SITE}/detail/u-2")), 1);
    let details = TabularStore::new()
        .read(&TabularTarget::new(fx.path("detail/2023-11/2023-11-03"), "Details"))
        .await
        .unwrap();
    assert_eq!(details[0].get("contract_number"), Some("HT-1"));
    assert_eq!(
        details[0].get("attachment_urls"),
        Some("http://site.test/file/F001, http://site.test/file/F002")
    );

    let attachments = harvester.run(Phase::Attachment).await.unwrap();
    assert_eq!(attachments.files_written, 2);
    assert_eq!(attachments.terminal_failures, 1);
    assert!(attachments.is_degraded());
    assert_eq!(
        std::fs::read(fx.path("attachments/2023-11/HT-1_Road repair_1.pdf")).unwrap(),
        b"%PDF-1"
    );
    assert_eq!(
        std::fs::read(fx.path("attachments/2023-11/HT-1_Road repair_2.pdf")).unwrap(),
        b"%PDF-2"
    );
    assert_eq!(fx.site.requests_for(&format!("{SITE}/file/F003")), 2);

    let ledger = harvester.ledger().latest_snapshot(Phase::Attachment).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].target.param("file_name"), Some("HT-2_Bridge paint_1.pdf"));

    // A second run skips what is on disk and only tries the missing file.
    let again = harvester.run(Phase::Attachment).await.unwrap();
    assert_eq!(again.skipped_existing, 2);
    assert_eq!(again.targets, 1);

    fx.site.serve(&format!("{SITE}/file/F003"), 200, "%PDF-3");
    let replay = harvester.retry_failed(Phase::Attachment).await.unwrap();
    assert_eq!(replay.files_written, 1);
    assert!(!replay.is_degraded());
    assert_eq!(
        std::fs::read(fx.path("attachments/2023-11/HT-2_Bridge paint_1.pdf")).unwrap(),
        b"%PDF-3"
    );
}

#[tokio::test]
async fn failed_listing_page_is_replayed_from_the_ledger() {
    let fx = Fixture::new();
    let page_two = fx.site.pages.lock().unwrap()["page:2"].clone();
    fx.site.serve("page:2", 503, "busy");
    let harvester = fx.harvester(CancellationToken::new());

    let first = harvester.run(Phase::Listing).await.unwrap();
    assert_eq!(first.terminal_failures, 1);
    assert_eq!(first.records_written, 2);
    assert_eq!(fx.site.requests_for("page:2"), 2);

    let ledger = harvester.ledger().latest_snapshot(Phase::Listing).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].target.identifier(), "page:2");
    assert_eq!(ledger[0].target.param("currentPage"), Some("2"));
    assert_eq!(ledger[0].attempt_count, 2);

    fx.site.serve("page:2", page_two.0, page_two.1);
    let replay = harvester.retry_failed(Phase::Listing).await.unwrap();
    assert_eq!(replay.targets, 1);
    assert_eq!(replay.records_written, 1);
    assert_eq!(replay.drops["out_of_range"], 1);
    assert_eq!(fx.site.requests_for("count"), 1, "count query is not replayed");
    assert_eq!(sheet_rows(&fx.path("listing/2023-11/2023-11-04"), "Contracts").await, 2);
}

#[tokio::test]
async fn run_all_chains_phases_in_order() {
    let fx = Fixture::new();
    let summary = fx.harvester(CancellationToken::new()).run_all().await.unwrap();

    let phases: Vec<Phase> = summary.phases.iter().map(|p| p.phase).collect();
    assert_eq!(phases, Phase::ALL);
    assert_eq!(summary.phases[2].files_written, 2);
    assert!(summary.is_degraded());
}

#[tokio::test]
async fn cancelled_run_fetches_nothing() {
    let fx = Fixture::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = fx.harvester(cancel).run_all().await.unwrap();
    assert!(summary.phases.is_empty());
    assert_eq!(fx.site.request_count(), 0);
}

#[tokio::test]
async fn detail_phase_without_listing_output_is_a_no_op() {
    let fx = Fixture::new();
    let summary = fx.harvester(CancellationToken::new()).run(Phase::Detail).await.unwrap();
    assert_eq!(summary.targets, 0);
    assert_eq!(fx.site.request_count(), 0);
}

#[test]
fn inverted_range_is_rejected_before_any_fetch() {
    let mut fx = Fixture::new();
    fx.config.detail.end_date = "2023-10-01".into();
    let range = DateRange::new(
        chrono::NaiveDate::from_ymd_opt(2023, 11, 1).unwrap(),
        chrono::NaiveDate::from_ymd_opt(2023, 11, 6).unwrap(),
    )
    .unwrap();

    let err = Harvester::new(
        fx.config.clone(),
        fx.site.clone(),
        Arc::new(RotatingIdentity::new(None, vec!["ua".into()])),
        Arc::new(ContractListing::new(&fx.config.source, range)),
        Arc::new(ContractDetail::new(&fx.config.source).unwrap()),
        CancellationToken::new(),
    )
    .err()
    .unwrap();
    assert!(err.is_fatal_configuration(), "got {err}");
    assert_eq!(fx.site.request_count(), 0);
}
