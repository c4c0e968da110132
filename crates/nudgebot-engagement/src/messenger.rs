//! Proactive Messenger — pick a recipient, compose a greeting, deliver it as a DM.
//!
//! `last_contacted_at` moves only after the gateway confirms delivery; a failed
//! attempt leaves the recipient first in line for the next cycle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nudgebot_core::error::{NudgeError, Result};
use nudgebot_core::traits::{Gateway, Responder};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::decision::select_proactive_recipient;
use crate::store::EngagementDb;

pub const NO_ELIGIBLE_RECIPIENTS: &str = "no eligible recipients";

/// Delivery metadata merged into the task record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub recipient_id: String,
    pub channel_id: String,
    pub message_ts: String,
    pub delivered_at: DateTime<Utc>,
}

pub struct ProactiveMessenger {
    gateway: Arc<dyn Gateway>,
    responder: Arc<dyn Responder>,
    store: Arc<EngagementDb>,
    rng: Mutex<StdRng>,
    send_timeout: Duration,
    generation_timeout: Duration,
}

impl ProactiveMessenger {
    pub fn new(gateway: Arc<dyn Gateway>, responder: Arc<dyn Responder>, store: Arc<EngagementDb>) -> Self {
        Self {
            gateway,
            responder,
            store,
            rng: Mutex::new(StdRng::from_entropy()),
            send_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(300),
        }
    }

    /// Deterministic recipient choice among never-contacted candidates.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_timeouts(mut self, send: Duration, generation: Duration) -> Self {
        self.send_timeout = send;
        self.generation_timeout = generation;
        self
    }

    pub async fn send_proactive(&self) -> Result<DeliveryReport> {
        self.send_proactive_at(Utc::now()).await
    }

    pub async fn send_proactive_at(&self, now: DateTime<Utc>) -> Result<DeliveryReport> {
        let candidates = self.store.list_recipients()?;
        let recipient = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| NudgeError::Internal("messenger rng mutex is poisoned".into()))?;
            select_proactive_recipient(&candidates, &mut *rng)
        };
        let Some(recipient) = recipient else {
            tracing::info!("📭 Proactive DM skipped: {}", NO_ELIGIBLE_RECIPIENTS);
            return Err(NudgeError::NotFound(NO_ELIGIBLE_RECIPIENTS.into()));
        };

        let content = tokio::time::timeout(self.generation_timeout, self.responder.compose_greeting())
            .await
            .map_err(|_| NudgeError::Timeout("compose_greeting".into()))??;

        let delivered = tokio::time::timeout(self.send_timeout, async {
            let channel_id = self.gateway.open_direct_channel(&recipient.id).await?;
            self.gateway.send_message(&channel_id, &content, None).await
        })
        .await
        .map_err(|_| {
            NudgeError::Timeout(format!(
                "direct message to {} exceeded {}s",
                recipient.id,
                self.send_timeout.as_secs()
            ))
        })
        .and_then(|sent| sent);

        let sent = match delivered {
            Ok(sent) => sent,
            Err(e) => {
                tracing::warn!("⚠️ Proactive DM to {} failed: {e}", recipient.id);
                return Err(e);
            }
        };

        self.store.mark_contacted(&recipient.id, now)?;
        tracing::info!("💬 Proactive DM delivered to {} ({})", recipient.id, sent.channel_id);
        Ok(DeliveryReport {
            recipient_id: recipient.id,
            channel_id: sent.channel_id,
            message_ts: sent.ts,
            delivered_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockGateway, MockResponder};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use nudgebot_core::types::Recipient;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn setup(ids: &[&str]) -> (Arc<MockGateway>, Arc<EngagementDb>, ProactiveMessenger) {
        let gateway = Arc::new(MockGateway::default());
        let store = Arc::new(EngagementDb::open(&PathBuf::from(":memory:")).unwrap());
        for id in ids {
            store.upsert_recipient(&Recipient::new(id)).unwrap();
        }
        let messenger = ProactiveMessenger::new(
            gateway.clone(),
            Arc::new(MockResponder::default()),
            store.clone(),
        )
        .with_seed(11);
        (gateway, store, messenger)
    }

    #[tokio::test]
    async fn test_n_sends_reach_n_distinct_recipients() {
        let ids = ["U1", "U2", "U3", "U4", "U5"];
        let (gateway, store, messenger) = setup(&ids);

        let mut seen = HashSet::new();
        for i in 0..ids.len() {
            let at = t0() + ChronoDuration::hours(i as i64);
            let report = messenger.send_proactive_at(at).await.unwrap();
            assert!(seen.insert(report.recipient_id.clone()), "repeat before exhausting tier");
            assert_eq!(store.get_recipient(&report.recipient_id).unwrap().last_contacted_at, Some(at));
        }
        assert_eq!(gateway.sent().len(), ids.len());

        // Everyone contacted: the oldest contact goes next.
        let first = gateway.opened()[0].clone();
        let report = messenger
            .send_proactive_at(t0() + ChronoDuration::days(1))
            .await
            .unwrap();
        assert_eq!(report.recipient_id, first);
    }

    #[tokio::test]
    async fn test_no_eligible_recipients_never_calls_gateway() {
        let (gateway, store, messenger) = setup(&[]);
        let mut bot = Recipient::new("B1");
        bot.is_bot = true;
        store.upsert_recipient(&bot).unwrap();

        let err = messenger.send_proactive_at(t0()).await.unwrap_err();
        assert!(err.to_string().contains(NO_ELIGIBLE_RECIPIENTS));
        assert!(gateway.opened().is_empty());
        assert_eq!(gateway.send_attempts(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_recipient_eligible() {
        let (gateway, store, messenger) = setup(&["U1"]);
        gateway.fail_next_sends([NudgeError::transport_fatal("channel_is_archived")]);

        let err = messenger.send_proactive_at(t0()).await.unwrap_err();
        assert!(err.to_string().contains("channel_is_archived"));
        assert!(store.get_recipient("U1").unwrap().last_contacted_at.is_none());

        let report = messenger.send_proactive_at(t0()).await.unwrap();
        assert_eq!(report.recipient_id, "U1");
        assert_eq!(report.channel_id, "D-U1");
    }
}
