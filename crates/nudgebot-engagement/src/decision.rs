//! Decision Engine — stateless probability, time-window and fairness checks.
//!
//! Every function takes its random input as a parameter so outcomes can be
//! replayed in tests. Callers draw from a `Draws` source.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use nudgebot_core::error::{NudgeError, Result};
use nudgebot_core::types::Recipient;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// `draw < probability`. Probabilities outside [0, 1] (and NaN) are rejected.
pub fn should_engage(probability: f64, draw: f64) -> Result<bool> {
    if !(0.0..=1.0).contains(&probability) {
        return Err(NudgeError::Validation(format!(
            "probability {probability} is outside [0, 1]"
        )));
    }
    Ok(draw < probability)
}

/// Half-open `[start, end)` hour window in `tz`. Unset bounds mean no restriction.
/// `start > end` wraps midnight; `start == end` is an empty window.
pub fn is_within_active_hours(
    time: DateTime<Utc>,
    start_hour: Option<u32>,
    end_hour: Option<u32>,
    tz: Tz,
) -> bool {
    let (Some(start), Some(end)) = (start_hour, end_hour) else {
        return true;
    };
    let hour = time.with_timezone(&tz).hour();
    if start <= end {
        start <= hour && hour < end
    } else {
        hour >= start || hour < end
    }
}

pub fn is_thread_too_active(message_count: usize, threshold: u64) -> bool {
    message_count as u64 >= threshold
}

/// Fair-distribution pick among active humans.
///
/// Never-contacted candidates are drawn uniformly at random and always exhausted
/// first. After that the oldest `last_contacted_at` wins; ties go to the lowest id.
pub fn select_proactive_recipient<R: Rng + ?Sized>(
    candidates: &[Recipient],
    rng: &mut R,
) -> Option<Recipient> {
    let eligible: Vec<&Recipient> = candidates.iter().filter(|r| r.is_eligible()).collect();

    let never_contacted: Vec<&Recipient> = eligible
        .iter()
        .copied()
        .filter(|r| r.last_contacted_at.is_none())
        .collect();
    if let Some(pick) = never_contacted.choose(rng) {
        return Some((*pick).clone());
    }

    eligible
        .into_iter()
        .min_by(|a, b| {
            a.last_contacted_at
                .cmp(&b.last_contacted_at)
                .then_with(|| a.id.cmp(&b.id))
        })
        .cloned()
}

/// How to answer a thread reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementType {
    Text,
    Reaction,
}

impl EngagementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngagementType::Text => "text",
            EngagementType::Reaction => "reaction",
        }
    }
}

/// Weighted split: `draw < text_weight` → text, otherwise reaction.
pub fn select_engagement_type(draw: f64, text_weight: f64) -> EngagementType {
    if draw < text_weight {
        EngagementType::Text
    } else {
        EngagementType::Reaction
    }
}

// ─── Draw sources ──────────────────────────────────────

/// Source of uniform draws in [0, 1).
pub trait Draws: Send + Sync {
    fn next_draw(&self) -> f64;
}

/// Fresh uniform sample per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomDraws;

impl Draws for RandomDraws {
    fn next_draw(&self) -> f64 {
        rand::thread_rng().r#gen::<f64>()
    }
}

/// Replays a fixed sequence, then repeats `fallback`.
#[derive(Debug)]
pub struct ScriptedDraws {
    queue: Mutex<VecDeque<f64>>,
    fallback: f64,
}

impl ScriptedDraws {
    pub fn new(draws: impl IntoIterator<Item = f64>, fallback: f64) -> Self {
        Self {
            queue: Mutex::new(draws.into_iter().collect()),
            fallback,
        }
    }
}

impl Draws for ScriptedDraws {
    fn next_draw(&self) -> f64 {
        self.queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn utc(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, 30, 0).unwrap()
    }

    #[test]
    fn test_should_engage_matches_strict_less_than() {
        let grid = [0.0, 0.1, 0.3, 0.5, 0.7, 0.99, 1.0];
        for &p in &grid {
            for &r in &grid {
                assert_eq!(should_engage(p, r).unwrap(), r < p, "p={p} r={r}");
            }
        }
        assert!(!should_engage(0.0, 0.0).unwrap());
        assert!(should_engage(1.0, 0.999_999).unwrap());
    }

    #[test]
    fn test_should_engage_rejects_out_of_range() {
        for p in [-0.01, 1.01, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                should_engage(p, 0.5),
                Err(NudgeError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_active_hours_unset_is_unrestricted() {
        assert!(is_within_active_hours(utc(3), None, Some(17), Tz::UTC));
        assert!(is_within_active_hours(utc(3), Some(9), None, Tz::UTC));
    }

    #[test]
    fn test_active_hours_half_open() {
        let at = |h| Utc.with_ymd_and_hms(2026, 3, 2, h, 0, 0).unwrap();
        assert!(is_within_active_hours(at(9), Some(9), Some(17), Tz::UTC));
        assert!(is_within_active_hours(utc(16), Some(9), Some(17), Tz::UTC));
        assert!(!is_within_active_hours(at(17), Some(9), Some(17), Tz::UTC));
        assert!(!is_within_active_hours(utc(8), Some(9), Some(17), Tz::UTC));
    }

    #[test]
    fn test_active_hours_uses_timezone() {
        // 14:30 UTC is 09:30 in New York (EST, UTC-5) on this date.
        let ny = chrono_tz::America::New_York;
        assert!(is_within_active_hours(utc(14), Some(9), Some(17), ny));
        assert!(!is_within_active_hours(utc(13), Some(9), Some(17), ny));
    }

    #[test]
    fn test_active_hours_wraps_midnight() {
        assert!(is_within_active_hours(utc(23), Some(22), Some(6), Tz::UTC));
        assert!(is_within_active_hours(utc(2), Some(22), Some(6), Tz::UTC));
        assert!(!is_within_active_hours(utc(12), Some(22), Some(6), Tz::UTC));
        assert!(!is_within_active_hours(utc(12), Some(12), Some(12), Tz::UTC));
    }

    #[test]
    fn test_thread_too_active_at_threshold() {
        assert!(!is_thread_too_active(9, 10));
        assert!(is_thread_too_active(10, 10));
        assert!(is_thread_too_active(0, 0));
    }

    fn human(id: &str, last: Option<i64>) -> Recipient {
        let mut r = Recipient::new(id);
        r.last_contacted_at = last.map(|h| utc(0) + Duration::hours(h));
        r
    }

    #[test]
    fn test_recipient_never_bot_or_inactive() {
        let mut bot = human("B1", None);
        bot.is_bot = true;
        let mut gone = human("X1", None);
        gone.is_active = false;

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let candidates = vec![bot.clone(), gone.clone(), human("U1", Some(5))];
            let pick = select_proactive_recipient(&candidates, &mut rng).unwrap();
            assert_eq!(pick.id, "U1");
        }
        assert!(select_proactive_recipient(&[bot, gone], &mut rng).is_none());
        assert!(select_proactive_recipient(&[], &mut rng).is_none());
    }

    #[test]
    fn test_never_contacted_tier_first() {
        let candidates = vec![
            human("U1", Some(1)),
            human("U2", None),
            human("U3", Some(0)),
            human("U4", None),
        ];
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let pick = select_proactive_recipient(&candidates, &mut rng).unwrap();
            assert!(pick.id == "U2" || pick.id == "U4");
        }
    }

    #[test]
    fn test_oldest_contact_then_lowest_id() {
        let mut rng = StdRng::seed_from_u64(1);
        let candidates = vec![human("U9", Some(3)), human("U5", Some(1)), human("U2", Some(2))];
        assert_eq!(select_proactive_recipient(&candidates, &mut rng).unwrap().id, "U5");

        let tied = vec![human("U9", Some(1)), human("U3", Some(1)), human("U7", Some(1))];
        assert_eq!(select_proactive_recipient(&tied, &mut rng).unwrap().id, "U3");
    }

    #[test]
    fn test_engagement_type_split() {
        assert_eq!(select_engagement_type(0.0, 0.7), EngagementType::Text);
        assert_eq!(select_engagement_type(0.69, 0.7), EngagementType::Text);
        assert_eq!(select_engagement_type(0.7, 0.7), EngagementType::Reaction);
        assert_eq!(select_engagement_type(0.95, 0.7), EngagementType::Reaction);
    }

    #[test]
    fn test_scripted_draws_then_fallback() {
        let draws = ScriptedDraws::new([0.1, 0.2], 0.9);
        assert_eq!(draws.next_draw(), 0.1);
        assert_eq!(draws.next_draw(), 0.2);
        assert_eq!(draws.next_draw(), 0.9);

        let d = RandomDraws.next_draw();
        assert!((0.0..1.0).contains(&d));
    }
}
