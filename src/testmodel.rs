// Test model (C4): typed test descriptions, per-test result history, weight
// computation inputs, and URL construction for browser tests.

use std::fmt;

use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A single recorded outcome of running a test once. Appended-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    pub milliseconds: u64,
    pub message: Option<String>,
}

/// Raw shape produced by the external "list continuous tests" helper. Kept
/// separate from [`Test`] so that parsing/validation (and rejection of
/// unknown `type` tags with a `ListingError`-flavoured message) happens at
/// one well-defined boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum RawTestDescription {
    #[serde(rename = "lint")]
    Lint { names: Vec<String>, repo: String, #[serde(default = "default_priority")] priority: f64 },
    #[serde(rename = "build")]
    Build {
        names: Vec<String>,
        repo: String,
        brands: Vec<String>,
        #[serde(default = "default_priority")]
        priority: f64,
    },
    #[serde(rename = "npm-run")]
    NpmRun {
        names: Vec<String>,
        repo: String,
        command: String,
        #[serde(default = "default_priority")]
        priority: f64,
    },
    #[serde(rename = "sim-test")]
    SimTest {
        names: Vec<String>,
        repo: String,
        url: String,
        #[serde(rename = "queryParameters")]
        query_parameters: Option<String>,
        #[serde(rename = "testQueryParameters")]
        test_query_parameters: Option<String>,
        #[serde(rename = "buildDependencies", default)]
        build_dependencies: Vec<String>,
        #[serde(default = "default_priority")]
        priority: f64,
    },
    #[serde(rename = "qunit-test")]
    QunitTest {
        names: Vec<String>,
        repo: String,
        url: String,
        #[serde(rename = "testQueryParameters")]
        test_query_parameters: Option<String>,
        #[serde(rename = "buildDependencies", default)]
        build_dependencies: Vec<String>,
        #[serde(default = "default_priority")]
        priority: f64,
    },
    #[serde(rename = "pageload-test")]
    PageloadTest {
        names: Vec<String>,
        repo: String,
        url: String,
        #[serde(rename = "testQueryParameters")]
        test_query_parameters: Option<String>,
        #[serde(rename = "buildDependencies", default)]
        build_dependencies: Vec<String>,
        #[serde(default = "default_priority")]
        priority: f64,
    },
    #[serde(rename = "wrapper-test")]
    WrapperTest {
        names: Vec<String>,
        repo: String,
        url: String,
        #[serde(rename = "testQueryParameters")]
        test_query_parameters: Option<String>,
        #[serde(rename = "buildDependencies", default)]
        build_dependencies: Vec<String>,
        #[serde(default = "default_priority")]
        priority: f64,
    },
    #[serde(rename = "internal")]
    Internal { names: Vec<String> },
}

fn default_priority() -> f64 {
    1.0
}

impl RawTestDescription {
    pub fn names(&self) -> &[String] {
        match self {
            Self::Lint { names, .. }
            | Self::Build { names, .. }
            | Self::NpmRun { names, .. }
            | Self::SimTest { names, .. }
            | Self::QunitTest { names, .. }
            | Self::PageloadTest { names, .. }
            | Self::WrapperTest { names, .. }
            | Self::Internal { names } => names,
        }
    }
}

/// Which of the four browser test flavours this is; each has a distinct HTML
/// driver page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrowserTestKind {
    SimTest,
    QunitTest,
    PageloadTest,
    WrapperTest,
}

impl BrowserTestKind {
    fn driver_page(self) -> &'static str {
        match self {
            Self::SimTest => "sim-test.html",
            Self::QunitTest => "qunit-test.html",
            Self::PageloadTest => "pageload-test.html",
            Self::WrapperTest => "wrapper-test.html",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserTestFields {
    pub kind: BrowserTestKind,
    pub repo: String,
    pub url: String,
    pub query_parameters: Option<String>,
    pub test_query_parameters: Option<String>,
    pub build_dependencies: Vec<String>,
}

/// The type-specific payload of a [`Test`], matching the distilled spec's
/// `type` enum one-for-one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestKind {
    Lint { repo: String },
    Build { repo: String, brands: Vec<String> },
    NpmRun { repo: String, command: String },
    Browser(BrowserTestFields),
    Internal,
}

impl TestKind {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Lint { .. } | Self::Build { .. } | Self::NpmRun { .. })
    }

    pub fn is_browser(&self) -> bool {
        matches!(self, Self::Browser(_))
    }

    pub fn repo(&self) -> Option<&str> {
        match self {
            Self::Lint { repo } | Self::Build { repo, .. } | Self::NpmRun { repo, .. } => {
                Some(repo)
            }
            Self::Browser(b) => Some(&b.repo),
            Self::Internal => None,
        }
    }
}

/// Mutable state that changes over a [`Test`]'s lifetime within its snapshot.
/// Held behind a mutex so the scheduler, result intake, and the report
/// builder can all touch it independently of the (immutable) identity/config
/// fields.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TestMutableState {
    pub results: Vec<TestResult>,
    pub complete: bool,
    pub success: bool,
    pub count: u64,
    #[serde(default)]
    pub weight: f64,
}

/// A single scheduled unit within a snapshot.
pub struct Test {
    pub names: Vec<String>,
    pub kind: TestKind,
    pub priority: f64,
    pub repo_commit_timestamp: Option<i64>,
    pub dependencies_commit_timestamp: Option<i64>,
    state: Mutex<TestMutableState>,
}

impl fmt::Debug for Test {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Test")
            .field("names", &self.names)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Test {
    pub fn new(
        names: Vec<String>,
        kind: TestKind,
        priority: f64,
        repo_commit_timestamp: Option<i64>,
        dependencies_commit_timestamp: Option<i64>,
    ) -> Self {
        Self {
            names,
            kind,
            priority,
            repo_commit_timestamp,
            dependencies_commit_timestamp,
            state: Mutex::new(TestMutableState::default()),
        }
    }

    /// Build directly from a parsed [`RawTestDescription`], computing commit
    /// timestamps from the caller-supplied map (primary repo -> timestamp,
    /// and the max over the repo's transitive dependencies).
    pub fn from_raw(
        raw: RawTestDescription,
        repo_commit_timestamp: impl Fn(&str) -> Option<i64>,
        deps_commit_timestamp: impl Fn(&str) -> Option<i64>,
    ) -> anyhow::Result<Self> {
        let names = raw.names().to_vec();
        if names.is_empty() {
            bail!("test listing produced a test with no name segments");
        }
        let (kind, priority, primary_repo) = match raw {
            RawTestDescription::Lint { repo, priority, .. } => {
                (TestKind::Lint { repo: repo.clone() }, priority, Some(repo))
            }
            RawTestDescription::Build {
                repo,
                brands,
                priority,
                ..
            } => {
                if brands.is_empty() {
                    bail!("build test {:?} has no brands", names);
                }
                (
                    TestKind::Build {
                        repo: repo.clone(),
                        brands,
                    },
                    priority,
                    Some(repo),
                )
            }
            RawTestDescription::NpmRun {
                repo,
                command,
                priority,
                ..
            } => (
                TestKind::NpmRun {
                    repo: repo.clone(),
                    command,
                },
                priority,
                Some(repo),
            ),
            RawTestDescription::SimTest {
                repo,
                url,
                query_parameters,
                test_query_parameters,
                build_dependencies,
                priority,
                ..
            } => (
                TestKind::Browser(BrowserTestFields {
                    kind: BrowserTestKind::SimTest,
                    repo: repo.clone(),
                    url,
                    query_parameters,
                    test_query_parameters,
                    build_dependencies,
                }),
                priority,
                Some(repo),
            ),
            RawTestDescription::QunitTest {
                repo,
                url,
                test_query_parameters,
                build_dependencies,
                priority,
                ..
            } => (
                TestKind::Browser(BrowserTestFields {
                    kind: BrowserTestKind::QunitTest,
                    repo: repo.clone(),
                    url,
                    query_parameters: None,
                    test_query_parameters,
                    build_dependencies,
                }),
                priority,
                Some(repo),
            ),
            RawTestDescription::PageloadTest {
                repo,
                url,
                test_query_parameters,
                build_dependencies,
                priority,
                ..
            } => (
                TestKind::Browser(BrowserTestFields {
                    kind: BrowserTestKind::PageloadTest,
                    repo: repo.clone(),
                    url,
                    query_parameters: None,
                    test_query_parameters,
                    build_dependencies,
                }),
                priority,
                Some(repo),
            ),
            RawTestDescription::WrapperTest {
                repo,
                url,
                test_query_parameters,
                build_dependencies,
                priority,
                ..
            } => (
                TestKind::Browser(BrowserTestFields {
                    kind: BrowserTestKind::WrapperTest,
                    repo: repo.clone(),
                    url,
                    query_parameters: None,
                    test_query_parameters,
                    build_dependencies,
                }),
                priority,
                Some(repo),
            ),
            RawTestDescription::Internal { .. } => (TestKind::Internal, 1.0, None),
        };

        let repo_ts = primary_repo.as_deref().and_then(&repo_commit_timestamp);
        let deps_ts = primary_repo.as_deref().and_then(&deps_commit_timestamp);
        Ok(Self::new(names, kind, priority, repo_ts, deps_ts))
    }

    /// A synthetic `internal` test recording whether the listing contained
    /// duplicate `nameString`s.
    pub fn internal_duplicate_check(had_duplicates: bool) -> Self {
        let test = Self::new(
            vec!["internal".to_owned(), "no-duplicate-tests".to_owned()],
            TestKind::Internal,
            1.0,
            None,
            None,
        );
        {
            let mut state = test.state.lock();
            state.complete = true;
            state.success = !had_duplicates;
            state.results.push(TestResult {
                passed: !had_duplicates,
                milliseconds: 0,
                message: if had_duplicates {
                    Some("duplicate nameString in test listing".to_owned())
                } else {
                    None
                },
            });
        }
        test
    }

    pub fn name_string(&self) -> String {
        self.names.join(".")
    }

    pub fn state(&self) -> TestMutableState {
        self.state.lock().clone()
    }

    pub fn results(&self) -> Vec<TestResult> {
        self.state.lock().results.clone()
    }

    pub fn complete(&self) -> bool {
        self.state.lock().complete
    }

    pub fn success(&self) -> bool {
        self.state.lock().success
    }

    pub fn count(&self) -> u64 {
        self.state.lock().count
    }

    pub fn weight(&self) -> f64 {
        self.state.lock().weight
    }

    pub fn set_weight(&self, weight: f64) {
        self.state.lock().weight = weight;
    }

    /// Overwrites the entire mutable state wholesale. Used only when
    /// reconstructing a `Test` from a persisted checkpoint.
    pub fn restore_state(&self, state: TestMutableState) {
        *self.state.lock() = state;
    }

    /// A local test is available iff it hasn't completed yet. Invariant (a):
    /// `complete` is terminal.
    pub fn available_local(&self) -> bool {
        self.kind.is_local() && !self.complete()
    }

    /// Marks a local test complete *before* its command runs (invariant: a
    /// subsequent `available_local` call must never return this test again,
    /// even if the caller hasn't recorded the outcome yet).
    pub fn mark_dispatched_local(&self) {
        self.state.lock().complete = true;
    }

    /// Records the single local-test outcome. Must be called at most once,
    /// after `mark_dispatched_local`.
    pub fn record_local_result(&self, result: TestResult) {
        let mut state = self.state.lock();
        state.success = result.passed;
        state.results.push(result);
    }

    /// Increments `count` and returns the new value; used at browser-test
    /// dispatch time, before the response is written, so repeat requests
    /// observe the increment even under concurrent access.
    pub fn dispatch_browser(&self) -> u64 {
        let mut state = self.state.lock();
        state.count += 1;
        state.count
    }

    pub fn record_browser_result(&self, result: TestResult) {
        self.state.lock().results.push(result);
    }

    /// Constructs the literal, bit-exact URL for a browser test dispatch, per
    /// §4.4. `base_url` is either the repository root (root-dir mode) or the
    /// snapshot-relative base.
    pub fn browser_url(&self, base_url: &str) -> anyhow::Result<String> {
        let TestKind::Browser(b) = &self.kind else {
            bail!("browser_url called on non-browser test {:?}", self.names);
        };
        let full_target = format!("{}/{}", base_url.trim_end_matches('/'), b.url);
        let mut url = format!(
            "{}?url={}",
            b.kind.driver_page(),
            urlencoding::encode(&full_target)
        );
        if b.kind == BrowserTestKind::SimTest {
            if let Some(qp) = &b.query_parameters {
                url.push_str(&format!("&simQueryParameters={}", urlencoding::encode(qp)));
            }
        }
        if let Some(tqp) = &b.test_query_parameters {
            url.push_str(&format!("&{tqp}"));
        }
        Ok(url)
    }
}

/// The dispatch object handed back to a browser client, or to a `?old=`
/// legacy-format request.
#[derive(Debug, Clone, Serialize)]
pub struct Dispatch {
    #[serde(rename = "snapshotName")]
    pub snapshot_name: Option<String>,
    pub test: Option<Vec<String>>,
    pub url: String,
    pub timestamp: i64,
}

impl Dispatch {
    pub fn empty() -> Self {
        Self {
            snapshot_name: None,
            test: None,
            url: "no-test.html".to_owned(),
            timestamp: 0,
        }
    }
}

/// Error raised when the listing helper's JSON doesn't parse into a known
/// test shape.
#[derive(Debug)]
pub struct ListingError(pub String);

impl fmt::Display for ListingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test listing error: {}", self.0)
    }
}

impl std::error::Error for ListingError {}

pub fn parse_listing(json: &str) -> anyhow::Result<Vec<RawTestDescription>> {
    serde_json::from_str(json).map_err(|e| anyhow!(ListingError(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn browser_test(kind: BrowserTestKind, query_parameters: Option<&str>, test_query_parameters: Option<&str>) -> Test {
        Test::new(
            vec!["alpha".into(), "fuzz".into(), "unbuilt".into()],
            TestKind::Browser(BrowserTestFields {
                kind,
                repo: "alpha".into(),
                url: "x/x_en.html".into(),
                query_parameters: query_parameters.map(str::to_owned),
                test_query_parameters: test_query_parameters.map(str::to_owned),
                build_dependencies: vec![],
            }),
            1.0,
            None,
            None,
        )
    }

    #[test]
    fn sim_test_url_is_bit_exact() {
        let t = browser_test(BrowserTestKind::SimTest, Some("brand=phet&ea"), None);
        let url = t.browser_url("snapshot-1000").unwrap();
        assert_eq!(
            url,
            "sim-test.html?url=snapshot-1000%2Fx%2Fx_en.html&simQueryParameters=brand%3Dphet%26ea"
        );
    }

    #[test_case(BrowserTestKind::QunitTest, "qunit-test.html"; "qunit")]
    #[test_case(BrowserTestKind::PageloadTest, "pageload-test.html"; "pageload")]
    #[test_case(BrowserTestKind::WrapperTest, "wrapper-test.html"; "wrapper")]
    fn other_browser_tests_ignore_sim_query_parameters(kind: BrowserTestKind, page: &str) {
        let t = browser_test(kind, None, None);
        let url = t.browser_url("snapshot-1000").unwrap();
        assert_eq!(url, format!("{page}?url=snapshot-1000%2Fx%2Fx_en.html"));
    }

    #[test]
    fn test_query_parameters_are_appended_last() {
        let t = browser_test(BrowserTestKind::QunitTest, None, Some("ea&fuzz"));
        let url = t.browser_url("snapshot-1000").unwrap();
        assert_eq!(url, "qunit-test.html?url=snapshot-1000%2Fx%2Fx_en.html&ea&fuzz");
    }

    #[test]
    fn complete_is_terminal_and_gates_availability() {
        let t = Test::new(
            vec!["alpha".into(), "lint".into()],
            TestKind::Lint { repo: "alpha".into() },
            1.0,
            None,
            None,
        );
        assert!(t.available_local());
        t.mark_dispatched_local();
        assert!(!t.available_local());
        t.record_local_result(TestResult {
            passed: true,
            milliseconds: 12,
            message: None,
        });
        assert!(t.success());
        assert!(!t.available_local());
    }

    #[test]
    fn browser_dispatch_increments_count_before_any_result() {
        let t = browser_test(BrowserTestKind::SimTest, None, None);
        assert_eq!(t.count(), 0);
        assert_eq!(t.dispatch_browser(), 1);
        assert_eq!(t.count(), 1);
        assert_eq!(t.dispatch_browser(), 2);
    }

    #[test]
    fn parse_listing_rejects_unknown_type() {
        let err = parse_listing(r#"[{"type":"not-a-real-type","names":["x"]}]"#).unwrap_err();
        assert!(err.to_string().contains("test listing error"));
    }

    #[test]
    fn internal_duplicate_check_records_failure_when_duplicates_found() {
        let t = Test::internal_duplicate_check(true);
        assert!(t.complete());
        assert!(!t.success());
        assert_eq!(t.results().len(), 1);
    }
}
