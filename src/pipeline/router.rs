//! Intent router: address rules, knowledge, contact rules, then generative fallback.
//!
//! Precedence is strict: an address-tier hit never consults the
//! knowledge base, and a knowledge match never reaches the model.
//!
//! The address tier covers address and purchase phrases, any message
//! naming a known location, and location answers to an earlier "where
//! are you" follow-up. Without a store to name it replies with the
//! overview once, then walks the follow-up cycle: two asks, a multiple
//! choice, then a restart. Contact requests that reach the generative
//! tier are answered from templates instead of the model.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::{GeoPrompts, ReplyTemplates, RuleSet, StoreEntry};
use crate::knowledge::{KnowledgeMatcher, KnowledgeSnapshot};
use crate::llm::GenerativeGateway;
use crate::pipeline::abort::AbortSignal;
use crate::pipeline::rules::{RegionRoute, RulesEngine, Signals};
use crate::pipeline::text::{normalize, normalize_reply};
use crate::pipeline::types::{Intent, ReplySource};
use crate::store::{Session, facts};

pub const RULE_ADDR_DEFAULT: &str = "ADDR_DEFAULT";
pub const RULE_ADDR_STORE_RECOMMEND: &str = "ADDR_STORE_RECOMMEND";
pub const RULE_ADDR_OUT_OF_COVERAGE: &str = "ADDR_OUT_OF_COVERAGE";
pub const RULE_CONTACT_SEND_IMAGE: &str = "CONTACT_SEND_IMAGE";
pub const RULE_CONTACT_FOLLOWUP: &str = "CONTACT_FOLLOWUP";

/// Follow-up rounds before the multiple-choice prompt.
const GEO_ASK_ROUNDS: u32 = 2;

/// Region named when nothing better is known.
const UNKNOWN_REGION: &str = "您所在地区";

/// Route reasons carried on a decision.
pub mod reasons {
    pub const ADDRESS_TRIGGER: &str = "address_trigger";
    pub const STORE_MATCH: &str = "store_match";
    pub const NEED_REGION: &str = "need_region";
    pub const NEED_DISTRICT: &str = "need_district";
    pub const OUT_OF_COVERAGE: &str = "out_of_coverage";
    pub const KNOWLEDGE_MATCH: &str = "knowledge_match";
    pub const CONTACT_REQUEST: &str = "contact_request";
    pub const GENERATIVE: &str = "generative";
    pub const GENERATIVE_DISABLED: &str = "generative_disabled";
    pub const GENERATIVE_TIMEOUT: &str = "generative_timeout";
}

/// Address image a route asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressImage {
    #[default]
    None,
    /// The all-stores overview, once per session.
    Overview,
    /// The image of the route's target store.
    Store,
}

/// Attachments a route asks for. The media planner applies suppression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteMedia {
    pub address_image: AddressImage,
    pub contact_image: bool,
}

/// A session fact to set (`Some`) or clear (`None`) when the route commits.
pub type FactUpdate = (&'static str, Option<String>);

/// The router's verdict for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub intent: Intent,
    pub rule_id: Option<String>,
    pub reply_text: String,
    pub reply_source: ReplySource,
    pub route_reason: String,
    /// Store named in an address recommendation.
    pub target_store: Option<String>,
    pub media: RouteMedia,
    pub fact_updates: Vec<FactUpdate>,
}

impl Route {
    fn rule(intent: Intent, rule_id: &str, reply_text: String, reason: &str) -> Self {
        Self {
            intent,
            rule_id: Some(rule_id.to_string()),
            reply_text,
            reply_source: ReplySource::Rule,
            route_reason: reason.into(),
            target_store: None,
            media: RouteMedia::default(),
            fact_updates: Vec::new(),
        }
    }

    fn reply(intent: Intent, reply_text: String, source: ReplySource, reason: &str) -> Self {
        Self {
            intent,
            rule_id: None,
            reply_text,
            reply_source: source,
            route_reason: reason.into(),
            target_store: None,
            media: RouteMedia::default(),
            fact_updates: Vec::new(),
        }
    }

    /// Write the route's fact updates into `session`.
    pub fn apply_facts(&self, session: &mut Session) {
        for (key, value) in &self.fact_updates {
            match value {
                Some(value) => session.set_fact(key, value.as_str()),
                None => {
                    session.facts.remove(*key);
                }
            }
        }
    }
}

/// Which location the follow-up asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeoAsk {
    Region,
    District,
}

impl GeoAsk {
    fn label(self) -> &'static str {
        match self {
            Self::Region => "REGION",
            Self::District => "DISTRICT",
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Self::Region => reasons::NEED_REGION,
            Self::District => reasons::NEED_DISTRICT,
        }
    }
}

fn clear_geo_followup() -> Vec<FactUpdate> {
    vec![
        (facts::LAST_GEO_PENDING, None),
        (facts::GEO_FOLLOWUP_ROUND, None),
        (facts::GEO_CHOICE_OFFERED, None),
    ]
}

/// Stateless classifier and dispatcher.
pub struct IntentRouter {
    rules: Arc<RulesEngine>,
    matcher: KnowledgeMatcher,
    gateway: Option<Arc<dyn GenerativeGateway>>,
    templates: ReplyTemplates,
    compliance_block: Vec<String>,
    timeout: Duration,
    context_turns: usize,
}

impl IntentRouter {
    pub fn new(
        rules: Arc<RulesEngine>,
        matcher: KnowledgeMatcher,
        gateway: Option<Arc<dyn GenerativeGateway>>,
        templates: ReplyTemplates,
        rule_set: &RuleSet,
        timeout: Duration,
        context_turns: usize,
    ) -> Self {
        Self {
            rules,
            matcher,
            gateway,
            templates,
            compliance_block: rule_set.compliance_block.clone(),
            timeout,
            context_turns,
        }
    }

    pub fn has_gateway(&self) -> bool {
        self.gateway.is_some()
    }

    /// Classify `text` and produce the reply.
    ///
    /// Reads the session but never writes it; state changes travel in
    /// [`Route::fact_updates`]. Returns `None` if `abort` fires while the
    /// generative call is outstanding.
    pub async fn route(
        &self,
        text: &str,
        signals: &Signals,
        session: &Session,
        knowledge: &KnowledgeSnapshot,
        abort: &AbortSignal,
    ) -> Option<Route> {
        if let Some(route) = self.address_route(text, signals, session) {
            return Some(route);
        }

        if let Some((entry, score)) = self.matcher.find(knowledge, text) {
            debug!(
                conversation_id = %session.id,
                entry_id = entry.id,
                score,
                "Knowledge match"
            );
            let mut route = Route::reply(
                Intent::Knowledge,
                entry.reply_text.clone(),
                ReplySource::Knowledge,
                reasons::KNOWLEDGE_MATCH,
            );
            route.rule_id = Some(entry.id.to_string());
            return Some(route);
        }

        if signals.contact {
            return Some(self.contact_route(session));
        }

        self.generative_route(text, session, abort).await
    }

    fn address_route(&self, text: &str, signals: &Signals, session: &Session) -> Option<Route> {
        let region = self.rules.resolve_region(text);
        let geo_reply =
            session.flag(facts::LAST_GEO_PENDING) && self.rules.looks_like_geo_reply(text);
        if !(signals.address || signals.purchase || geo_reply || !region.is_unknown()) {
            return None;
        }

        let overview_sent = session.flag(facts::ADDRESS_IMAGE_SENT);
        let route = match region {
            RegionRoute::Store(store) => self.store_route(store),
            RegionRoute::OutOfCoverage { region } => self.out_of_coverage_route(region, session),
            RegionRoute::NeedDistrict { .. } | RegionRoute::Unknown if !overview_sent => {
                self.overview_route()
            }
            RegionRoute::NeedDistrict { .. } => self.geo_followup(GeoAsk::District, session),
            RegionRoute::Unknown => self.geo_followup(GeoAsk::Region, session),
        };
        debug!(
            conversation_id = %session.id,
            rule_id = ?route.rule_id,
            route_reason = %route.route_reason,
            "Address tier"
        );
        Some(route)
    }

    fn overview_route(&self) -> Route {
        let mut route = Route::rule(
            Intent::Address,
            RULE_ADDR_DEFAULT,
            self.templates.address_default.clone(),
            reasons::ADDRESS_TRIGGER,
        );
        route.media.address_image = AddressImage::Overview;
        // The overview ends by asking which store is closest.
        route.fact_updates = vec![(facts::LAST_GEO_PENDING, Some("true".into()))];
        route
    }

    fn store_route(&self, store: &StoreEntry) -> Route {
        let mut route = Route::rule(
            Intent::Address,
            RULE_ADDR_STORE_RECOMMEND,
            self.templates.render_store(&store.name),
            reasons::STORE_MATCH,
        );
        route.target_store = Some(store.name.clone());
        route.media.address_image = AddressImage::Store;
        route.fact_updates = clear_geo_followup();
        route
    }

    fn out_of_coverage_route(&self, region: String, session: &Session) -> Route {
        let region = Some(region)
            .filter(|r| !r.trim().is_empty())
            .or_else(|| session.fact(facts::LAST_DETECTED_REGION).map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_REGION.to_string());
        let mut route = Route::rule(
            Intent::Address,
            RULE_ADDR_OUT_OF_COVERAGE,
            self.templates.render_region(&region),
            reasons::OUT_OF_COVERAGE,
        );
        route.media.contact_image = true;
        route.fact_updates = clear_geo_followup();
        route
            .fact_updates
            .push((facts::LAST_DETECTED_REGION, Some(region)));
        route
    }

    fn geo_followup(&self, ask: GeoAsk, session: &Session) -> Route {
        let prompts: &GeoPrompts = match ask {
            GeoAsk::Region => &self.templates.ask_region,
            GeoAsk::District => &self.templates.ask_district,
        };
        let round = session.count(facts::GEO_FOLLOWUP_ROUND);
        let choice_offered = session.flag(facts::GEO_CHOICE_OFFERED);

        let (step, text, next_round, offered) = if round < GEO_ASK_ROUNDS {
            let next = round + 1;
            let text = if next == 1 { &prompts.r1 } else { &prompts.r2 };
            (format!("R{next}"), text, next, false)
        } else if !choice_offered {
            ("CHOICE".to_string(), &prompts.choice, round, true)
        } else {
            ("R1_RESET".to_string(), &prompts.r1_reset, 1, false)
        };

        let mut route = Route::rule(
            Intent::Address,
            &format!("ADDR_ASK_{}_{step}", ask.label()),
            text.clone(),
            ask.reason(),
        );
        route.fact_updates = vec![
            (facts::GEO_FOLLOWUP_ROUND, Some(next_round.to_string())),
            (facts::GEO_CHOICE_OFFERED, offered.then(|| "true".to_string())),
            (facts::LAST_GEO_PENDING, Some("true".into())),
        ];
        route
    }

    fn contact_route(&self, session: &Session) -> Route {
        if !session.flag(facts::CONTACT_IMAGE_SENT) {
            let mut route = Route::rule(
                Intent::Generative,
                RULE_CONTACT_SEND_IMAGE,
                self.templates.contact_intro.clone(),
                reasons::CONTACT_REQUEST,
            );
            route.media.contact_image = true;
            return route;
        }

        let prompted = session.count(facts::CONTACT_FOLLOWUP_COUNT);
        let text = &self.templates.contact_followup[(prompted % 2) as usize];
        let mut route = Route::rule(
            Intent::Generative,
            RULE_CONTACT_FOLLOWUP,
            text.clone(),
            reasons::CONTACT_REQUEST,
        );
        route.fact_updates = vec![(
            facts::CONTACT_FOLLOWUP_COUNT,
            Some(prompted.saturating_add(1).to_string()),
        )];
        route
    }

    async fn generative_route(
        &self,
        text: &str,
        session: &Session,
        abort: &AbortSignal,
    ) -> Option<Route> {
        let Some(gateway) = &self.gateway else {
            return Some(self.fallback(reasons::GENERATIVE_DISABLED));
        };
        if abort.is_aborted() {
            return None;
        }

        let context = session.recent(self.context_turns);
        let call = tokio::time::timeout(self.timeout, gateway.generate(context, text));

        let result = tokio::select! {
            biased;
            _ = abort.aborted() => {
                info!(conversation_id = %session.id, "Generative call aborted");
                return None;
            }
            result = call => result,
        };

        match result {
            Ok(Ok(raw)) => {
                let reply = normalize_reply(&raw, &self.compliance_block, &self.templates);
                let reply = self.avoid_repeat(reply, session);
                Some(Route::reply(
                    Intent::Generative,
                    reply,
                    ReplySource::Llm,
                    reasons::GENERATIVE,
                ))
            }
            Ok(Err(e)) => {
                warn!(
                    conversation_id = %session.id,
                    model = gateway.model_name(),
                    error = %e,
                    "Generative call failed, using fallback"
                );
                Some(self.fallback(e.route_reason()))
            }
            Err(_) => {
                warn!(
                    conversation_id = %session.id,
                    model = gateway.model_name(),
                    timeout_secs = self.timeout.as_secs_f32(),
                    "Generative call timed out, using fallback"
                );
                Some(self.fallback(reasons::GENERATIVE_TIMEOUT))
            }
        }
    }

    fn fallback(&self, reason: &str) -> Route {
        Route::reply(
            Intent::Generative,
            self.templates.generative_fallback.clone(),
            ReplySource::Fallback,
            reason,
        )
    }

    /// Swap a reply that repeats an earlier agent reply for one from the
    /// repeat pool, preferring pool entries not used yet.
    fn avoid_repeat(&self, reply: String, session: &Session) -> String {
        let folded = normalize(&reply);
        let used: Vec<String> = session.agent_replies().map(normalize).collect();
        if !used.iter().any(|u| *u == folded) {
            return reply;
        }

        let fresh: Vec<&String> = self
            .templates
            .repeat_pool
            .iter()
            .filter(|p| !used.contains(&normalize(p)))
            .collect();
        let mut rng = rand::thread_rng();
        let picked = if fresh.is_empty() {
            self.templates.repeat_pool.choose(&mut rng)
        } else {
            fresh.choose(&mut rng).copied()
        };
        debug!(conversation_id = %session.id, "Replaced repeated reply");
        picked.cloned().unwrap_or(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::error::GenerativeError;
    use crate::knowledge::KnowledgeEntry;
    use crate::pipeline::abort::abort_pair;
    use crate::store::Turn;

    /// Gateway returning a fixed result after an optional delay.
    struct MockGateway {
        reply: Result<String, GenerativeError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl MockGateway {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.into()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(err: GenerativeError) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(err),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok("late".into()),
                delay,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl GenerativeGateway for MockGateway {
        fn model_name(&self) -> &str {
            "mock"
        }

        async fn generate(&self, _context: &[Turn], _text: &str) -> Result<String, GenerativeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reply.clone()
        }
    }

    fn router(gateway: Option<Arc<dyn GenerativeGateway>>, timeout: Duration) -> IntentRouter {
        let rule_set = RuleSet::default();
        IntentRouter::new(
            Arc::new(RulesEngine::from_rule_set(&rule_set).unwrap()),
            KnowledgeMatcher::new(0.6),
            gateway,
            ReplyTemplates::default(),
            &rule_set,
            timeout,
            6,
        )
    }

    fn session() -> Session {
        Session::new("c1", Utc::now(), chrono::Duration::days(30))
    }

    fn knowledge() -> KnowledgeSnapshot {
        KnowledgeSnapshot::new(vec![
            KnowledgeEntry::new(1, &["发货时间", "多久发货"], "48小时内发货", 1),
            KnowledgeEntry::new(2, &["地址"], "knowledge should never answer address", 100),
        ])
    }

    async fn route(router: &IntentRouter, text: &str, session: &Session) -> Route {
        let signals = router.rules.evaluate(text);
        router
            .route(text, &signals, session, &knowledge(), &AbortSignal::never())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn address_beats_knowledge() {
        let gateway = MockGateway::ok("unused");
        let router = router(Some(gateway.clone()), Duration::from_secs(1));
        let route = route(&router, "地址在哪里", &session()).await;
        assert_eq!(route.intent, Intent::Address);
        assert_eq!(route.rule_id.as_deref(), Some(RULE_ADDR_DEFAULT));
        assert_eq!(route.reply_source, ReplySource::Rule);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn address_with_region_recommends_store() {
        let router = router(None, Duration::from_secs(1));
        let route = route(&router, "我在静安，门店怎么走", &session()).await;
        assert_eq!(route.rule_id.as_deref(), Some(RULE_ADDR_STORE_RECOMMEND));
        assert_eq!(route.target_store.as_deref(), Some("上海静安店"));
        assert!(route.reply_text.contains("上海静安店"));
    }

    #[tokio::test]
    async fn knowledge_match_skips_model() {
        let gateway = MockGateway::ok("unused");
        let router = router(Some(gateway.clone()), Duration::from_secs(1));
        let route = route(&router, "多久发货", &session()).await;
        assert_eq!(route.intent, Intent::Knowledge);
        assert_eq!(route.rule_id.as_deref(), Some("1"));
        assert_eq!(route.reply_text, "48小时内发货");
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_gateway_uses_fallback() {
        let router = router(None, Duration::from_secs(1));
        let route = route(&router, "不同价格有什么区别啊？", &session()).await;
        assert_eq!(route.intent, Intent::Generative);
        assert_eq!(route.reply_source, ReplySource::Fallback);
        assert_eq!(route.route_reason, reasons::GENERATIVE_DISABLED);
        assert_eq!(route.reply_text, ReplyTemplates::default().generative_fallback);
    }

    #[tokio::test]
    async fn generative_reply_is_normalized() {
        let router = router(Some(MockGateway::ok("姐姐  这款是真人发 12:30")), Duration::from_secs(1));
        let route = route(&router, "这款是什么材质", &session()).await;
        assert_eq!(route.reply_source, ReplySource::Llm);
        assert_eq!(route.route_reason, reasons::GENERATIVE);
        assert_eq!(route.reply_text, "姐姐 这款是真人发。");
    }

    #[tokio::test]
    async fn provider_error_falls_back() {
        let router = router(
            Some(MockGateway::failing(GenerativeError::RateLimited {
                provider: "mock".into(),
            })),
            Duration::from_secs(1),
        );
        let route = route(&router, "这款是什么材质", &session()).await;
        assert_eq!(route.reply_source, ReplySource::Fallback);
        assert_eq!(route.route_reason, "generative_rate_limited");
    }

    #[tokio::test]
    async fn timeout_falls_back() {
        let router = router(Some(MockGateway::slow(Duration::from_secs(5))), Duration::from_millis(20));
        let route = route(&router, "这款是什么材质", &session()).await;
        assert_eq!(route.reply_source, ReplySource::Fallback);
        assert_eq!(route.route_reason, reasons::GENERATIVE_TIMEOUT);
    }

    #[tokio::test]
    async fn abort_interrupts_generation() {
        let router = router(Some(MockGateway::slow(Duration::from_secs(5))), Duration::from_secs(10));
        let (handle, signal) = abort_pair();
        let session = session();
        let signals = Signals::default();
        let snapshot = knowledge();

        let routed = router.route("这款是什么材质", &signals, &session, &snapshot, &signal);
        let abort = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.abort();
        };
        let (result, ()) = tokio::join!(routed, abort);
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn repeated_reply_is_replaced() {
        let mut templates = ReplyTemplates::default();
        templates.repeat_pool = vec!["姐姐我在，您继续说呀🌹".into()];
        let mut router = router(Some(MockGateway::ok("好的。")), Duration::from_secs(1));
        router.templates = templates;

        let mut session = session();
        session.push_turn(Turn::agent("好的。", Utc::now(), []), 20);
        let route = route(&router, "这款是什么材质", &session).await;
        assert_eq!(route.reply_text, "姐姐我在，您继续说呀🌹");
    }

    #[tokio::test]
    async fn context_is_bounded() {
        struct ContextRecorder(AtomicUsize);

        #[async_trait]
        impl GenerativeGateway for ContextRecorder {
            fn model_name(&self) -> &str {
                "recorder"
            }
            async fn generate(&self, context: &[Turn], _text: &str) -> Result<String, GenerativeError> {
                self.0.store(context.len(), Ordering::SeqCst);
                Ok("收到".into())
            }
        }

        let recorder = Arc::new(ContextRecorder(AtomicUsize::new(0)));
        let router = router(Some(recorder.clone()), Duration::from_secs(1));
        let mut session = session();
        for i in 0..10 {
            session.push_turn(Turn::user(format!("问题{i}"), Utc::now()), 20);
        }
        route(&router, "这款是什么材质", &session).await;
        assert_eq!(recorder.0.load(Ordering::SeqCst), 6);
    }

    /// A session whose overview image already went out.
    fn seen_overview() -> Session {
        let mut s = session();
        s.set_flag(facts::ADDRESS_IMAGE_SENT);
        s
    }

    #[tokio::test]
    async fn first_purchase_question_gets_overview() {
        let router = router(None, Duration::from_secs(1));
        let route = route(&router, "怎么买", &session()).await;
        assert_eq!(route.intent, Intent::Address);
        assert_eq!(route.rule_id.as_deref(), Some(RULE_ADDR_DEFAULT));
        assert_eq!(route.media.address_image, AddressImage::Overview);
    }

    #[tokio::test]
    async fn followups_cycle_two_asks_then_choice_then_reset() {
        let router = router(None, Duration::from_secs(1));
        let mut session = seen_overview();
        let mut rule_ids = Vec::new();
        for text in ["怎么买", "怎么买呀", "怎么买啊", "我想买", "还是想买"] {
            let route = route(&router, text, &session).await;
            assert_eq!(route.intent, Intent::Address);
            assert_eq!(route.media, RouteMedia::default());
            route.apply_facts(&mut session);
            rule_ids.push(route.rule_id.unwrap());
        }
        assert_eq!(
            rule_ids,
            vec![
                "ADDR_ASK_REGION_R1",
                "ADDR_ASK_REGION_R2",
                "ADDR_ASK_REGION_CHOICE",
                "ADDR_ASK_REGION_R1_RESET",
                "ADDR_ASK_REGION_R2",
            ]
        );
        assert!(session.flag(facts::LAST_GEO_PENDING));
    }

    #[tokio::test]
    async fn multi_store_city_asks_for_district() {
        let router = router(None, Duration::from_secs(1));
        let mut session = seen_overview();
        let first = route(&router, "你们上海店的地址在哪", &session).await;
        assert_eq!(first.rule_id.as_deref(), Some("ADDR_ASK_DISTRICT_R1"));
        assert_eq!(first.route_reason, reasons::NEED_DISTRICT);
        assert_eq!(first.reply_text, ReplyTemplates::default().ask_district.r1);
        first.apply_facts(&mut session);

        // The district answer lands on a store and closes the follow-up.
        let answer = route(&router, "徐汇", &session).await;
        assert_eq!(answer.rule_id.as_deref(), Some(RULE_ADDR_STORE_RECOMMEND));
        assert_eq!(answer.media.address_image, AddressImage::Store);
        answer.apply_facts(&mut session);
        assert!(!session.flag(facts::LAST_GEO_PENDING));
        assert_eq!(session.count(facts::GEO_FOLLOWUP_ROUND), 0);
    }

    #[tokio::test]
    async fn region_without_store_offers_contact() {
        let gateway = MockGateway::ok("unused");
        let router = router(Some(gateway.clone()), Duration::from_secs(1));
        let route = route(&router, "我不在北京和上海", &session()).await;
        assert_eq!(route.intent, Intent::Address);
        assert_eq!(route.rule_id.as_deref(), Some(RULE_ADDR_OUT_OF_COVERAGE));
        assert_eq!(route.route_reason, reasons::OUT_OF_COVERAGE);
        assert!(route.reply_text.contains("非沪京地区"));
        assert!(route.media.contact_image);
        assert_eq!(route.media.address_image, AddressImage::None);
        assert!(route
            .fact_updates
            .contains(&(facts::LAST_DETECTED_REGION, Some("非沪京地区".into()))));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);

        let route = route_text(&router, "黑龙江门店具体地址在哪").await;
        assert_eq!(route.rule_id.as_deref(), Some(RULE_ADDR_OUT_OF_COVERAGE));
        assert!(route.reply_text.contains("黑龙江"));
    }

    async fn route_text(router: &IntentRouter, text: &str) -> Route {
        route(router, text, &session()).await
    }

    #[tokio::test]
    async fn location_answer_counts_only_while_pending() {
        let router = router(None, Duration::from_secs(1));
        let mut pending = seen_overview();
        pending.set_flag(facts::LAST_GEO_PENDING);
        let route_pending = route(&router, "我在大连市", &pending).await;
        assert_eq!(route_pending.intent, Intent::Address);
        assert_eq!(route_pending.route_reason, reasons::NEED_REGION);

        let idle = route(&router, "我在大连市", &seen_overview()).await;
        assert_eq!(idle.intent, Intent::Generative);
    }

    #[tokio::test]
    async fn contact_request_sends_image_then_alternates_nudges() {
        let gateway = MockGateway::ok("unused");
        let router = router(Some(gateway.clone()), Duration::from_secs(1));
        let templates = ReplyTemplates::default();

        let first = route(&router, "加个微信", &session()).await;
        assert_eq!(first.rule_id.as_deref(), Some(RULE_CONTACT_SEND_IMAGE));
        assert_eq!(first.reply_text, templates.contact_intro);
        assert_eq!(first.reply_source, ReplySource::Rule);
        assert!(first.media.contact_image);

        let mut session = session();
        session.set_flag(facts::CONTACT_IMAGE_SENT);
        let mut texts = Vec::new();
        for _ in 0..3 {
            let route = route(&router, "加个微信", &session).await;
            assert_eq!(route.rule_id.as_deref(), Some(RULE_CONTACT_FOLLOWUP));
            assert!(!route.media.contact_image);
            route.apply_facts(&mut session);
            texts.push(route.reply_text);
        }
        assert_eq!(
            texts,
            vec![
                templates.contact_followup[0].clone(),
                templates.contact_followup[1].clone(),
                templates.contact_followup[0].clone(),
            ]
        );
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn knowledge_outranks_contact_request() {
        let router = router(None, Duration::from_secs(1));
        let route = route(&router, "多久发货，加个微信", &session()).await;
        assert_eq!(route.intent, Intent::Knowledge);
        assert_eq!(route.rule_id.as_deref(), Some("1"));
    }
}
