//! Media planner: picks attachments from intent, signals and session facts.

use std::collections::HashSet;

use tracing::debug;

use crate::pipeline::router::{AddressImage, Route, RouteMedia};
use crate::pipeline::rules::Signals;
use crate::pipeline::types::{Intent, MediaPlan};
use crate::store::{Session, facts};

/// Derives a [`MediaPlan`] for a decision. Never blocks, never calls out.
#[derive(Debug, Clone)]
pub struct MediaPlanner {
    video_delay_secs: u64,
    address_image_cap: u32,
    whitelist: HashSet<String>,
}

impl MediaPlanner {
    pub fn new(video_delay_secs: u64) -> Self {
        Self {
            video_delay_secs,
            address_image_cap: 6,
            whitelist: HashSet::new(),
        }
    }

    /// Stop sending store images after `cap` address images per session.
    pub fn with_address_image_cap(mut self, cap: u32) -> Self {
        self.address_image_cap = cap;
        self
    }

    /// Conversations that always get the media they ask for.
    pub fn with_whitelist(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.whitelist = ids.into_iter().collect();
        self
    }

    /// Plan attachments for a bare intent, as if routed to the overview.
    ///
    /// - address intent → address image, unless already sent
    /// - contact signal (any intent) → contact image, unless already sent
    /// - video trigger → delayed video, unless already scheduled
    pub fn plan(&self, intent: Intent, signals: &Signals, session: &mut Session) -> MediaPlan {
        let media = RouteMedia {
            address_image: if intent == Intent::Address {
                AddressImage::Overview
            } else {
                AddressImage::None
            },
            contact_image: false,
        };
        self.plan_media(intent, media, None, signals, session)
    }

    /// Plan attachments for a routed message and mark the matching facts.
    ///
    /// Store images are sent once per store and at most
    /// `address_image_cap` times per session; whitelisted conversations
    /// skip both limits and the once-per-session contact image limit.
    pub fn plan_route(&self, route: &Route, signals: &Signals, session: &mut Session) -> MediaPlan {
        self.plan_media(
            route.intent,
            route.media,
            route.target_store.as_deref(),
            signals,
            session,
        )
    }

    fn plan_media(
        &self,
        intent: Intent,
        media: RouteMedia,
        target_store: Option<&str>,
        signals: &Signals,
        session: &mut Session,
    ) -> MediaPlan {
        let mut plan = MediaPlan::default();
        let whitelisted = self.whitelist.contains(&session.id);

        if intent == Intent::Address {
            let send = match (media.address_image, target_store) {
                (AddressImage::Overview, _) => {
                    whitelisted || !session.flag(facts::ADDRESS_IMAGE_SENT)
                }
                (AddressImage::Store, Some(store)) => {
                    whitelisted
                        || (session.count(facts::ADDRESS_IMAGE_SENT_COUNT) < self.address_image_cap
                            && !session.fact_list(facts::SENT_ADDRESS_STORES).contains(&store))
                }
                _ => false,
            };
            if send {
                plan.address_image = true;
                session.set_flag(facts::ADDRESS_IMAGE_SENT);
                session.bump_count(facts::ADDRESS_IMAGE_SENT_COUNT);
                if let (AddressImage::Store, Some(store)) = (media.address_image, target_store) {
                    session.add_to_list(facts::SENT_ADDRESS_STORES, store);
                }
            }
        }

        if (signals.contact || media.contact_image)
            && (whitelisted || !session.flag(facts::CONTACT_IMAGE_SENT))
        {
            plan.contact_image = true;
            session.set_flag(facts::CONTACT_IMAGE_SENT);
            session.facts.remove(facts::LAST_GEO_PENDING);
        }

        if signals.video && !session.flag(facts::VIDEO_SCHEDULED) {
            plan.delayed_video = Some(self.video_delay_secs);
            session.set_flag(facts::VIDEO_SCHEDULED);
        }

        debug!(
            conversation_id = %session.id,
            intent = intent.label(),
            whitelisted,
            target_store = ?target_store,
            address_image = plan.address_image,
            contact_image = plan.contact_image,
            delayed_video = ?plan.delayed_video,
            "Media planned"
        );
        plan
    }
}
