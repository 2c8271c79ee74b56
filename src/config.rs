//! Configuration types.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reply engine configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding the session store and conversation journal.
    pub data_dir: PathBuf,
    /// Knowledge base JSON file.
    pub knowledge_file: PathBuf,
    /// How long an admitted fingerprint blocks identical messages.
    pub dedup_ttl: Duration,
    /// Width of the time bucket folded into each fingerprint.
    pub dedup_bucket: Duration,
    /// Session expiry measured from the last activity.
    pub session_ttl: Duration,
    /// Maximum turns kept in a session's history.
    pub history_limit: usize,
    /// Minimum knowledge score for a match.
    pub knowledge_threshold: f32,
    /// Hard timeout on the generative call.
    pub generative_timeout: Duration,
    /// Number of history turns handed to the generative gateway.
    pub context_turns: usize,
    /// Delay before the deferred video is sent.
    pub video_delay_secs: u64,
    /// First retry delay after a failed store write (doubles per attempt).
    pub store_retry_base: Duration,
    /// Upper bound for the store write retry delay.
    pub store_retry_max: Duration,
    /// Store images sent per conversation before further ones are skipped.
    pub address_image_cap: u32,
    /// Conversations exempt from media suppression (media test accounts).
    pub media_whitelist: Vec<String>,
    /// Brand system prompt document folded into the generative prompt.
    pub system_prompt_file: Option<PathBuf>,
    /// Reply playbook document folded into the generative prompt.
    pub playbook_file: Option<PathBuf>,
    /// Trigger sets consulted by the router and media planner.
    pub rules: RuleSet,
    /// Fixed reply texts.
    pub templates: ReplyTemplates,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            knowledge_file: PathBuf::from("./config/knowledge_base.json"),
            dedup_ttl: Duration::from_secs(120),
            dedup_bucket: Duration::from_secs(60),
            session_ttl: Duration::from_secs(30 * 24 * 3600), // 30 days
            history_limit: 20,
            knowledge_threshold: 0.6,
            generative_timeout: Duration::from_secs(20),
            context_turns: 6,
            video_delay_secs: 8,
            store_retry_base: Duration::from_millis(500),
            store_retry_max: Duration::from_secs(60),
            address_image_cap: 6,
            media_whitelist: Vec::new(),
            system_prompt_file: None,
            playbook_file: None,
            rules: RuleSet::default(),
            templates: ReplyTemplates::default(),
        }
    }
}

impl AgentConfig {
    /// Build a config from `KF_ASSIST_*` environment variables.
    ///
    /// Unset variables keep their defaults; unparsable values are logged
    /// and replaced by the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("KF_ASSIST_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            knowledge_file: std::env::var("KF_ASSIST_KNOWLEDGE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.knowledge_file),
            dedup_ttl: Duration::from_secs(
                env_or("KF_ASSIST_DEDUP_TTL_SECS", defaults.dedup_ttl.as_secs())
                    .min(MAX_WINDOW_SECS),
            ),
            dedup_bucket: Duration::from_secs(
                env_or("KF_ASSIST_DEDUP_BUCKET_SECS", defaults.dedup_bucket.as_secs())
                    .clamp(1, MAX_WINDOW_SECS),
            ),
            session_ttl: session_ttl_from_days(env_or::<u64>("KF_ASSIST_SESSION_TTL_DAYS", 30)),
            history_limit: env_or("KF_ASSIST_HISTORY_LIMIT", defaults.history_limit).max(2),
            knowledge_threshold: env_or(
                "KF_ASSIST_KNOWLEDGE_THRESHOLD",
                defaults.knowledge_threshold,
            )
            .clamp(0.0, 1.0),
            generative_timeout: Duration::from_secs(
                env_or(
                    "KF_ASSIST_LLM_TIMEOUT_SECS",
                    defaults.generative_timeout.as_secs(),
                )
                .min(MAX_WINDOW_SECS),
            ),
            context_turns: env_or("KF_ASSIST_CONTEXT_TURNS", defaults.context_turns),
            video_delay_secs: env_or("KF_ASSIST_VIDEO_DELAY_SECS", defaults.video_delay_secs)
                .min(MAX_WINDOW_SECS),
            address_image_cap: env_or("KF_ASSIST_ADDRESS_IMAGE_CAP", defaults.address_image_cap),
            media_whitelist: std::env::var("KF_ASSIST_MEDIA_WHITELIST")
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.media_whitelist),
            system_prompt_file: env_path("KF_ASSIST_SYSTEM_PROMPT_FILE"),
            playbook_file: env_path("KF_ASSIST_PLAYBOOK_FILE"),
            ..defaults
        }
    }

    /// Read the prompt documents. Missing or unreadable files read as empty.
    pub fn load_prompt_docs(&self) -> PromptDocs {
        PromptDocs {
            system: read_doc(self.system_prompt_file.as_deref()),
            playbook: read_doc(self.playbook_file.as_deref()),
        }
    }

    /// Session store file under the data directory.
    pub fn session_store_path(&self) -> PathBuf {
        self.data_dir.join("agent_memory.json")
    }

    /// Conversation journal directory under the data directory.
    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }
}

/// Brand documents quoted in the generative prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptDocs {
    pub system: String,
    pub playbook: String,
}

fn read_doc(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return String::new();
    };
    match std::fs::read_to_string(path) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Prompt document unreadable, skipping");
            String::new()
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

/// Comma-separated list, blanks dropped.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Upper bound for second-valued windows and delays (one day).
const MAX_WINDOW_SECS: u64 = 24 * 3600;

/// Upper bound for the session TTL (ten years).
const MAX_SESSION_TTL_DAYS: u64 = 3650;

fn session_ttl_from_days(days: u64) -> Duration {
    let days = days.clamp(1, MAX_SESSION_TTL_DAYS);
    Duration::from_secs(days.checked_mul(24 * 3600).unwrap_or(u64::MAX))
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Debug,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = ?default, "Invalid config value, using default");
            default
        }),
        Err(_) => default,
    }
}

/// A physical store the address rule can recommend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    /// Display name rendered into the recommendation.
    pub name: String,
    /// Region keywords that select this store.
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl StoreEntry {
    fn new(name: &str, keywords: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Keyword sets driving intent routing and media planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    /// Phrases that make a message address-intent.
    pub address_triggers: Vec<String>,
    /// Buying phrases; answered like address questions since buying means
    /// visiting a store or a remote fitting.
    pub purchase_triggers: Vec<String>,
    /// Phrases signalling the customer asks for a contact channel.
    pub contact_signals: Vec<String>,
    /// Phrases that schedule the delayed try-on video.
    pub video_triggers: Vec<String>,
    /// Off-platform contact terms never allowed in a generated reply.
    pub compliance_block: Vec<String>,
    /// Store directory for address recommendations.
    pub stores: Vec<StoreEntry>,
    /// Cities with at least one store, checked for "not in <city>".
    pub covered_cities: Vec<String>,
    /// Cities with several stores, where the customer is asked for a district.
    pub district_cities: Vec<String>,
    /// Region used when the customer is in none of the covered cities.
    pub outside_all_label: String,
    /// Provinces and cities without a store.
    pub non_coverage_regions: Vec<String>,
}

impl Default for RuleSet {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            address_triggers: strings(&[
                "地址", "在哪", "怎么走", "门店", "店铺", "实体店", "线下店", "位置", "导航",
                "到店",
            ]),
            purchase_triggers: strings(&["怎么买", "想买", "哪里买", "哪买", "购买", "怎么下单"]),
            contact_signals: strings(&[
                "微信", "微信号", "联系电话", "电话", "手机号", "qq", "二维码", "邮箱",
                "怎么关注", "如何关注", "关注客服", "联系客服", "怎么联系", "如何联系",
            ]),
            video_triggers: strings(&[
                "佩戴效果", "上头效果", "戴上效果", "效果视频", "真人视频", "实拍视频",
                "有视频吗",
            ]),
            compliance_block: strings(&[
                "微信", "微信号", "联系电话", "电话", "手机号", "qq", "二维码", "外链", "邮箱",
            ]),
            stores: vec![
                StoreEntry::new(
                    "北京朝阳店",
                    &[
                        "北京", "朝阳", "海淀", "丰台", "东城", "西城", "通州", "昌平", "大兴",
                        "顺义", "房山", "门头沟", "石景山", "河北", "天津",
                    ],
                ),
                StoreEntry::new("上海静安店", &["静安", "普陀", "长宁"]),
                StoreEntry::new("上海徐汇店", &["徐汇", "闵行"]),
                StoreEntry::new("上海虹口店", &["虹口", "宝山"]),
                StoreEntry::new("上海五角场店", &["五角场", "杨浦"]),
                StoreEntry::new("上海人广店", &["人广", "人民广场", "黄浦", "浦东"]),
            ],
            covered_cities: strings(&["上海", "北京"]),
            district_cities: strings(&["上海"]),
            outside_all_label: "非沪京地区".into(),
            non_coverage_regions: strings(&[
                "黑龙江", "吉林", "辽宁", "内蒙古", "山西", "山东", "江苏", "浙江", "安徽",
                "福建", "江西", "河南", "湖北", "湖南", "广东", "广西", "海南", "四川", "贵州",
                "云南", "西藏", "陕西", "甘肃", "青海", "宁夏", "新疆", "重庆", "香港", "澳门",
                "台湾", "东北", "苏州", "杭州", "南京", "广州", "深圳", "成都", "武汉",
            ]),
        }
    }
}

/// Fixed reply texts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplyTemplates {
    /// Address reply when no store region is mentioned.
    pub address_default: String,
    /// Address reply naming a store; `{store_name}` is substituted.
    pub store_recommend: String,
    /// Reply used when the generative path is unavailable or fails.
    pub generative_fallback: String,
    /// Reply used when the generative gateway returns nothing usable.
    pub general_empty: String,
    /// Replacement for generated replies that leak contact channels.
    pub compliance: String,
    /// Alternatives used instead of repeating an earlier reply.
    pub repeat_pool: Vec<String>,
    /// Follow-ups asking which city or region the customer is in.
    pub ask_region: GeoPrompts,
    /// Follow-ups asking which district of a multi-store city.
    pub ask_district: GeoPrompts,
    /// Reply for regions without a store; `{region}` is substituted.
    pub non_coverage_contact: String,
    /// Reply sent with the contact image.
    pub contact_intro: String,
    /// Alternating nudges once the contact image was sent.
    pub contact_followup: [String; 2],
}

/// One cycle of location follow-ups: two asks, a multiple choice, then a
/// restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoPrompts {
    pub r1: String,
    pub r2: String,
    pub choice: String,
    pub r1_reset: String,
}

impl Default for ReplyTemplates {
    fn default() -> Self {
        Self {
            address_default: "姐姐，我们目前北京朝阳1家、上海5家（静安、人广、虹口、五角场、徐汇）门店，我给您发一张位置图，您看下哪家离您最近～🌹".into(),
            store_recommend: "姐姐，推荐您去{store_name}，我给您发一张位置图，您跟着图走会更直观～🌹".into(),
            generative_fallback: "姐姐抱歉，系统现在有点忙，您稍后再发我马上跟进您哦🌹".into(),
            general_empty: "姐姐我在呢，您告诉我最关心的是价格、佩戴体验还是门店位置呀🌹".into(),
            compliance: "姐姐我们先在这里沟通就好，我先帮您把需求和方案梳理清楚呀🌹".into(),
            repeat_pool: vec![
                "姐姐我在，您可以继续说下最关心的问题呀🌹".into(),
                "姐姐收到，我帮您一步步梳理最合适的方案呀🌹".into(),
                "姐姐明白，我先把关键点给您讲清楚呀🌹".into(),
            ],
            ask_region: GeoPrompts {
                r1: "姐姐，您在什么城市/区域呀？方便告诉我吗？我可以帮您针对性推荐门店，我们目前北京朝阳1家、上海5家（静安、人广、虹口、五角场、徐汇）🌹".into(),
                r2: "姐姐，我再帮您确认一下，您现在在哪个城市或区域呀？我按距离给您匹配最近门店～🌹".into(),
                choice: "姐姐您在静安/徐汇/杨浦附近吗？不确定也没关系，告诉我个地标我也能帮您匹配～🌹".into(),
                r1_reset: "姐姐我再帮您快速确认下，您在什么城市或区域呀？我马上按距离给您匹配最近门店～🌹".into(),
            },
            ask_district: GeoPrompts {
                r1: "姐姐您在上海哪个区呀？我帮您匹配最近门店～🌹".into(),
                r2: "姐姐再确认下，您在上海哪个区或附近地标呢？我马上给您对门店～🌹".into(),
                choice: "姐姐您在静安/徐汇/杨浦附近吗？不确定也没关系，告诉我个地标我也能帮您匹配～🌹".into(),
                r1_reset: "姐姐我再确认下，您在上海哪个区呀？我这边马上帮您匹配最近门店～🌹".into(),
            },
            non_coverage_contact: "姐姐，{region}暂时没有我们的门店，目前假发是需要根据头围和脸型进行私人定制的，您可以看看下面图中画圈圈的地方，会有专门的老师跟您远程鉴定～💗".into(),
            contact_intro: "姐姐我给您发一张联系方式图，您按图添加后我这边一对一继续跟进您呀😊".into(),
            contact_followup: [
                "姐姐您看下我刚发的联系方式图，按图添加后跟我说一声，我马上接着帮您安排😊".into(),
                "姐姐刚刚那张联系方式图您点开就能看到，添加后回我一句，我立刻继续帮您跟进😊".into(),
            ],
        }
    }
}

impl ReplyTemplates {
    /// Render the store recommendation for `store_name`.
    pub fn render_store(&self, store_name: &str) -> String {
        self.store_recommend.replace("{store_name}", store_name)
    }

    /// Render the out-of-coverage reply for `region`.
    pub fn render_region(&self, region: &str) -> String {
        self.non_coverage_contact.replace("{region}", region)
    }
}
