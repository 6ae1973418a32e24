use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use statescraper_rs::{
    BehaviorProfile, CascadeSelector, DomElementDetector, Detector, ExecutorConfig, ExecutorError,
    NetworkError, NetworkRotator, Observations, ProxyConfig, ResolutionError, RotationTrigger,
    RunOutcome, SelectorResolver, SelectorType, SessionContext, State, StateError,
    StateMachineExecutor, StateResult, Transition, UrlPatternDetector, create_cascade,
    modules::MemorySink,
};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Fake browser: the page currently shown plus scenario switches.
#[derive(Debug, Default)]
struct Site {
    page: Mutex<Observations>,
    loops_left: AtomicUsize,
    fail_results: bool,
    captcha_on_search: bool,
    cancel_in_results: Option<CancellationToken>,
    exits: Mutex<Vec<String>>,
}

impl Site {
    fn at(page: Observations) -> Self {
        Self {
            page: Mutex::new(page),
            ..Self::default()
        }
    }

    fn loops(self, loops: usize) -> Self {
        self.loops_left.store(loops, Ordering::SeqCst);
        self
    }

    fn navigate(&self, page: Observations) {
        *self.page.lock().unwrap() = page;
    }

    fn snapshot(&self) -> Observations {
        self.page.lock().unwrap().clone()
    }

    fn exited(&self, state: &str) {
        self.exits.lock().unwrap().push(state.to_string());
    }
}

fn page(path: &str, text: &str, selectors: &[&str]) -> Observations {
    let mut observations = Observations::new()
        .with_url(Url::parse(&format!("https://shop.test{path}")).unwrap())
        .with_page_text(text);
    for selector in selectors {
        observations = observations.with_selector(*selector);
    }
    observations
}

fn login_page(primary_button: bool) -> Observations {
    if primary_button {
        page("/login", "Please Sign in", &["//button[@id='login']"])
    } else {
        page("/login", "Please Sign in", &[])
    }
}

fn search_page() -> Observations {
    page("/search", "Search the catalogue", &["input[name=q]", "//input[@name='q']"])
}

fn results_page() -> Observations {
    page("/results?q=lamp", "12 results", &[".result"])
}

struct PageResolver<'a> {
    site: &'a Site,
}

#[async_trait]
impl SelectorResolver for PageResolver<'_> {
    type Output = String;

    async fn resolve(&self, selector: &CascadeSelector) -> Result<Option<String>, ResolutionError> {
        let page = self.site.snapshot();
        let found = match selector.selector_type {
            SelectorType::XPath | SelectorType::Css => page.has_selector(&selector.selector),
            SelectorType::Text => page
                .page_text
                .as_deref()
                .is_some_and(|text| text.contains(&selector.selector)),
            SelectorType::Visual => {
                return Err(ResolutionError::Unsupported("no screenshot backend".into()));
            }
        };
        Ok(found.then(|| selector.selector.clone()))
    }
}

struct LoginState {
    detector: UrlPatternDetector,
}

#[async_trait]
impl State<Site> for LoginState {
    fn name(&self) -> &str {
        "login"
    }

    async fn detect(&self, ctx: &SessionContext<Site>) -> StateResult<bool> {
        Ok(self.detector.evaluate(&ctx.data.snapshot()).detected)
    }

    async fn execute(&mut self, ctx: &mut SessionContext<Site>) -> StateResult<()> {
        let cascade = ctx.cascade(vec![
            CascadeSelector::new("//button[@id='login']", SelectorType::XPath, 0),
            CascadeSelector::new("button#login", SelectorType::Css, 1),
            CascadeSelector::new("Sign in", SelectorType::Text, 2),
            CascadeSelector::new("login-button.png", SelectorType::Visual, 3),
        ]);
        let clicked = cascade.execute(&PageResolver { site: &ctx.data }).await;
        if !clicked.is_success() {
            return Err(StateError::ElementNotFound("login button".into()));
        }
        ctx.data.navigate(search_page());
        Ok(())
    }

    async fn transition(&mut self, _ctx: &SessionContext<Site>) -> StateResult<Transition> {
        Ok(Transition::to("search"))
    }

    async fn exit(&mut self, ctx: &mut SessionContext<Site>) -> StateResult<()> {
        ctx.data.exited("login");
        Ok(())
    }
}

struct SearchState {
    detector: DomElementDetector,
}

#[async_trait]
impl State<Site> for SearchState {
    fn name(&self) -> &str {
        "search"
    }

    async fn detect(&self, ctx: &SessionContext<Site>) -> StateResult<bool> {
        Ok(self.detector.evaluate(&ctx.data.snapshot()).detected)
    }

    async fn execute(&mut self, ctx: &mut SessionContext<Site>) -> StateResult<()> {
        let cascade = create_cascade(
            [
                ("//input[@name='q']", SelectorType::XPath, "search box"),
                ("input[name=q]", SelectorType::Css, "search box"),
            ],
            ctx.cascade_metrics().clone(),
        );
        let found = cascade.execute(&PageResolver { site: &ctx.data }).await;
        if !found.is_success() {
            return Err(StateError::ElementNotFound("search box".into()));
        }
        ctx.data.navigate(results_page());

        if ctx.data.captcha_on_search {
            ctx.acquire_proxy()?;
            ctx.report_proxy_failure(RotationTrigger::Captcha)?;
            return Err(StateError::Other("captcha served on search".into()));
        }
        Ok(())
    }

    async fn transition(&mut self, _ctx: &SessionContext<Site>) -> StateResult<Transition> {
        Ok(Transition::to("results"))
    }

    async fn exit(&mut self, ctx: &mut SessionContext<Site>) -> StateResult<()> {
        ctx.data.exited("search");
        Ok(())
    }
}

struct ResultsState;

#[async_trait]
impl State<Site> for ResultsState {
    fn name(&self) -> &str {
        "results"
    }

    async fn detect(&self, ctx: &SessionContext<Site>) -> StateResult<bool> {
        Ok(ctx.data.snapshot().has_selector(".result"))
    }

    async fn execute(&mut self, ctx: &mut SessionContext<Site>) -> StateResult<()> {
        if let Some(token) = &ctx.data.cancel_in_results {
            token.cancel();
        }
        if ctx.data.fail_results {
            return Err(StateError::ElementNotFound(".price".into()));
        }
        Ok(())
    }

    async fn transition(&mut self, ctx: &SessionContext<Site>) -> StateResult<Transition> {
        let remaining = ctx.data.loops_left.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(Transition::Complete);
        }
        ctx.data.loops_left.store(remaining - 1, Ordering::SeqCst);
        ctx.data.navigate(search_page());
        Ok(Transition::to("search"))
    }

    async fn exit(&mut self, ctx: &mut SessionContext<Site>) -> StateResult<()> {
        ctx.data.exited("results");
        Ok(())
    }
}

fn executor_with(rotator: Option<Arc<NetworkRotator>>) -> StateMachineExecutor<Site> {
    let mut builder = StateMachineExecutor::<Site>::builder()
        .with_state(LoginState {
            detector: UrlPatternDetector::new(["/login"]),
        })
        .with_state(SearchState {
            detector: DomElementDetector::css(["input[name=q]"]),
        })
        .with_state(ResultsState)
        .with_config(
            ExecutorConfig::default()
                .with_max_detection_attempts(2)
                .with_detection_poll_interval(Duration::from_millis(1)),
        );
    if let Some(rotator) = rotator {
        builder = builder.with_network_rotator(rotator);
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn healthy_session_stays_machine_like() {
    let mut executor = executor_with(None);
    let mut ctx = executor.new_context(Site::at(login_page(true)).loops(6));

    let report = executor.run(&mut ctx, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.visited.len(), 1 + 2 * 7);
    assert_eq!(report.failed_operations, 0);
    assert_eq!(report.final_level, 0.0);
    assert_eq!(ctx.profile, BehaviorProfile::MACHINE_LIKE);
    assert_eq!(ctx.success_rate, Some(1.0));

    let cascade = executor.cascade_metrics().get_metrics();
    assert_eq!(cascade.primary_success_rate, 1.0);
    assert_eq!(cascade.text_fallback_rate, 0.0);
}

#[tokio::test]
async fn degrading_session_escalates_behavior() {
    let mut executor = executor_with(None);
    let site = Site {
        fail_results: true,
        ..Site::at(login_page(false))
    }
    .loops(8);
    let mut ctx = executor.new_context(site);

    let report = executor.run(&mut ctx, &CancellationToken::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.failed_operations, 9);
    assert!(report.final_level > 0.0);
    assert!(ctx.success_rate.unwrap() < 0.7);
    assert_eq!(ctx.profile, executor.current_profile());
    assert!(ctx.profile.delay_range.0 > BehaviorProfile::MACHINE_LIKE.delay_range.0);

    // The login button only resolved through its text fallback.
    let cascade = executor.cascade_metrics().get_metrics();
    assert!(cascade.text_fallback_rate > 0.0);
    assert!(cascade.primary_success_rate < 1.0);

    executor.reset_adaptation();
    assert_eq!(executor.level(), 0.0);
    assert_eq!(executor.current_profile(), BehaviorProfile::MACHINE_LIKE);
    assert!(executor.history().is_empty());
}

#[tokio::test]
async fn captchas_quarantine_shared_proxies_and_escalate() {
    let rotator = Arc::new(NetworkRotator::from_proxies([
        ProxyConfig::new("10.0.0.1", 3128).with_region("eu"),
        ProxyConfig::new("10.0.0.2", 3128).with_region("us"),
    ]));
    let mut executor = executor_with(Some(rotator.clone()));
    let site = Site {
        captcha_on_search: true,
        ..Site::at(login_page(true))
    }
    .loops(5);
    let mut ctx = executor.new_context(site);

    let report = executor.run(&mut ctx, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let metrics = rotator.get_metrics();
    assert_eq!(metrics.quarantined_count, 2);
    assert_eq!(metrics.recent_captchas, 2);
    assert!(matches!(
        rotator.get_proxy(),
        Err(NetworkError::PoolExhausted { .. })
    ));
    assert!(report.final_level > 0.0);
}

#[tokio::test]
async fn cancellation_exits_the_running_state() {
    let mut executor = executor_with(None);
    let cancel = CancellationToken::new();
    let site = Site {
        cancel_in_results: Some(cancel.clone()),
        ..Site::at(login_page(true))
    }
    .loops(3);
    let mut ctx = executor.new_context(site);

    let report = executor.run(&mut ctx, &cancel).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.visited, vec!["login", "search", "results"]);
    assert_eq!(
        *ctx.data.exits.lock().unwrap(),
        vec!["login", "search", "results"]
    );
}

#[tokio::test]
async fn detection_starts_mid_flow() {
    let mut executor = executor_with(None);
    let mut ctx = executor.new_context(Site::at(results_page()));

    let report = executor.run(&mut ctx, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.visited, vec!["results"]);
}

#[tokio::test]
async fn unrecognised_page_fails_with_no_active_state() {
    let sink = Arc::new(MemorySink::new());
    let mut executor = StateMachineExecutor::<Site>::builder()
        .with_state(LoginState {
            detector: UrlPatternDetector::new(["/login"]),
        })
        .with_config(
            ExecutorConfig::default()
                .with_max_detection_attempts(3)
                .with_detection_poll_interval(Duration::from_millis(1)),
        )
        .with_debug_sink(sink.clone())
        .build()
        .unwrap();
    let mut ctx = executor.new_context(Site::at(page("/maintenance", "Back soon", &[])));

    let err = executor.run(&mut ctx, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ExecutorError::NoActiveState { attempts: 3 }));
    assert_eq!(sink.records().len(), 1);
}
