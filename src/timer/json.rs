//! Canonical JSON codec for [`Timer`] (spec §4.1 `from_json`/`to_json`,
//! §6.2 wire format).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::time::MonoMs;

use super::{Timer, TimerId};

/// Result of parsing a timer body: the timer plus the two booleans the
/// handler needs to classify where the request came from (spec §4.1).
#[derive(Debug, Clone)]
pub struct ParsedTimer {
    pub timer: Timer,
    /// True iff `reliability.replicas` was explicit in the body — this is
    /// a replicated-inbound PUT from a peer, not a client request.
    pub replicated: bool,
    /// True iff the message carries site information that marks it as
    /// having arrived from another geo-redundant site.
    pub gr_replicated: bool,
}

#[derive(Debug, Deserialize)]
struct TimerBody {
    timing: Option<TimingBody>,
    callback: Option<CallbackBody>,
    reliability: Option<ReliabilityBody>,
    statistics: Option<StatisticsBody>,
}

#[derive(Debug, Deserialize)]
struct TimingBody {
    interval: Option<u64>,
    #[serde(rename = "repeat-for")]
    repeat_for: Option<u64>,
    #[serde(rename = "start-time-delta")]
    start_time_delta: Option<i64>,
    #[serde(rename = "start-time")]
    start_time: Option<i64>,
    #[serde(rename = "sequence-number")]
    sequence_number: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    http: Option<HttpCallbackBody>,
}

#[derive(Debug, Deserialize)]
struct HttpCallbackBody {
    uri: Option<String>,
    opaque: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReliabilityBody {
    #[serde(rename = "cluster-view-id")]
    cluster_view_id: Option<String>,
    replicas: Option<Vec<String>>,
    #[serde(rename = "replication-factor")]
    replication_factor: Option<u32>,
    sites: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct StatisticsBody {
    #[serde(rename = "tag-info")]
    tag_info: Option<Vec<TagInfoBody>>,
}

#[derive(Debug, Deserialize)]
struct TagInfoBody {
    #[serde(rename = "type")]
    tag_type: Option<String>,
    count: Option<u32>,
}

/// Parses a timer JSON body (spec §4.1, §6.2).
///
/// `replication_factor_hint` and `replica_hash_hint` come from the URL
/// suffix (spec §4.1 `url()`); a hint of `0` means "no hint supplied".
pub fn from_json(
    id: TimerId,
    replication_factor_hint: u32,
    now_mono_ms: MonoMs,
    now_wall_ms: i64,
    body: &[u8],
) -> Result<ParsedTimer> {
    let parsed: TimerBody =
        serde_json::from_slice(body).map_err(|e| Error::MalformedJson(e.to_string()))?;

    let timing = parsed.timing.as_ref();
    let interval_secs = timing
        .and_then(|t| t.interval)
        .ok_or(Error::MissingField("timing.interval"))?;
    let interval_ms = interval_secs.saturating_mul(1000) as u32;

    let repeat_for_secs = timing.and_then(|t| t.repeat_for).unwrap_or(interval_secs);
    let repeat_for_ms = repeat_for_secs.saturating_mul(1000) as u32;

    if interval_ms == 0 && repeat_for_ms != 0 {
        return Err(Error::InvalidTiming {
            repeat_for_ms: repeat_for_ms as u64,
        });
    }

    let start_time_mono_ms = match (
        timing.and_then(|t| t.start_time_delta),
        timing.and_then(|t| t.start_time),
    ) {
        (Some(delta), _) => now_mono_ms.wrapping_add(delta as i32 as u32),
        (None, Some(wall_ms)) => {
            let delta = wall_ms - now_wall_ms;
            now_mono_ms.wrapping_add(delta as i32 as u32)
        }
        (None, None) => now_mono_ms,
    };

    let sequence_number = timing.and_then(|t| t.sequence_number).unwrap_or(0);

    let http = parsed
        .callback
        .as_ref()
        .and_then(|c| c.http.as_ref())
        .ok_or(Error::MissingField("callback.http"))?;
    let callback_url = http
        .uri
        .clone()
        .ok_or(Error::MissingField("callback.http.uri"))?;
    let callback_body = http
        .opaque
        .clone()
        .ok_or(Error::MissingField("callback.http.opaque"))?;

    let reliability = parsed.reliability.as_ref();
    let cluster_view_id = reliability
        .and_then(|r| r.cluster_view_id.clone())
        .unwrap_or_default();

    let explicit_replicas = reliability.and_then(|r| r.replicas.clone());
    let replicated = explicit_replicas.is_some();
    if let Some(ref replicas) = explicit_replicas {
        if replicas.is_empty() {
            return Err(Error::InvalidReplicas(
                "explicit replicas array was empty".into(),
            ));
        }
    }

    let body_replication_factor = reliability.and_then(|r| r.replication_factor);
    if let (Some(body_rf), true) = (body_replication_factor, replication_factor_hint != 0) {
        if body_rf != replication_factor_hint {
            return Err(Error::ReplicaMismatch {
                body: body_rf,
                hint: replication_factor_hint,
            });
        }
    }
    let replication_factor = body_replication_factor
        .or(explicit_replicas.as_ref().map(|r| r.len() as u32))
        .unwrap_or(if replication_factor_hint != 0 {
            replication_factor_hint
        } else {
            1
        });

    if let Some(ref replicas) = explicit_replicas {
        if replication_factor_hint != 0 && replicas.len() as u32 != replication_factor_hint {
            return Err(Error::InvalidReplicas(format!(
                "explicit replicas has {} entries but hint requires {}",
                replicas.len(),
                replication_factor_hint
            )));
        }
    }

    let replicas = explicit_replicas.clone().unwrap_or_default();
    let sites = reliability.and_then(|r| r.sites.clone()).unwrap_or_default();
    let gr_replicated = !sites.is_empty() && replicated;

    let mut tags = BTreeMap::new();
    if let Some(stats) = parsed.statistics.as_ref() {
        if let Some(tag_info) = stats.tag_info.as_ref() {
            for entry in tag_info {
                if let (Some(ty), Some(count)) = (entry.tag_type.clone(), entry.count) {
                    if count > 0 {
                        tags.insert(ty, count);
                    }
                }
            }
        }
    }

    let timer = Timer {
        id,
        start_time_mono_ms,
        interval_ms,
        repeat_for_ms,
        sequence_number,
        cluster_view_id,
        replicas,
        extra_replicas: Vec::new(),
        sites,
        tags,
        callback_url,
        callback_body,
        replication_factor,
        replica_tracker: 0,
    };

    Ok(ParsedTimer {
        timer,
        replicated,
        gr_replicated,
    })
}

#[derive(Debug, Serialize)]
struct TimerBodyOut {
    timing: TimingBodyOut,
    callback: CallbackBodyOut,
    reliability: ReliabilityBodyOut,
    statistics: StatisticsBodyOut,
}

#[derive(Debug, Serialize)]
struct TimingBodyOut {
    #[serde(rename = "start-time-delta")]
    start_time_delta: i64,
    #[serde(rename = "sequence-number")]
    sequence_number: u32,
    interval: u64,
    #[serde(rename = "repeat-for")]
    repeat_for: u64,
}

#[derive(Debug, Serialize)]
struct CallbackBodyOut {
    http: HttpCallbackBodyOut,
}

#[derive(Debug, Serialize)]
struct HttpCallbackBodyOut {
    uri: String,
    opaque: String,
}

#[derive(Debug, Serialize)]
struct ReliabilityBodyOut {
    #[serde(rename = "cluster-view-id")]
    cluster_view_id: String,
    replicas: Vec<String>,
    sites: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StatisticsBodyOut {
    #[serde(rename = "tag-info")]
    tag_info: Vec<TagInfoBodyOut>,
}

#[derive(Debug, Serialize)]
struct TagInfoBodyOut {
    #[serde(rename = "type")]
    tag_type: String,
    count: u32,
}

/// Emits the canonical JSON representation (spec §4.1 `to_json`), always
/// preferring `start-time-delta` re-computed from `now_mono_ms` so the
/// receiver reconstructs the original absolute start time independent of
/// clock skew between the two nodes.
pub fn to_json(timer: &Timer, now_mono_ms: MonoMs) -> Vec<u8> {
    let delta = timer.start_time_mono_ms.wrapping_sub(now_mono_ms) as i32 as i64;
    let out = TimerBodyOut {
        timing: TimingBodyOut {
            start_time_delta: delta,
            sequence_number: timer.sequence_number,
            interval: (timer.interval_ms / 1000) as u64,
            repeat_for: (timer.repeat_for_ms / 1000) as u64,
        },
        callback: CallbackBodyOut {
            http: HttpCallbackBodyOut {
                uri: timer.callback_url.clone(),
                opaque: timer.callback_body.clone(),
            },
        },
        reliability: ReliabilityBodyOut {
            cluster_view_id: timer.cluster_view_id.clone(),
            replicas: timer.replicas.clone(),
            sites: timer.sites.clone(),
        },
        statistics: StatisticsBodyOut {
            tag_info: timer
                .tags
                .iter()
                .map(|(k, v)| TagInfoBodyOut {
                    tag_type: k.clone(),
                    count: *v,
                })
                .collect(),
        },
    };
    serde_json::to_vec(&out).expect("Timer JSON serialization is infallible")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_interval() {
        let body = br#"{"callback":{"http":{"uri":"http://x","opaque":"y"}}}"#;
        let err = from_json(1, 0, 0, 0, body).unwrap_err();
        assert!(matches!(err, Error::MissingField("timing.interval")));
    }

    #[test]
    fn rejects_zero_interval_with_nonzero_repeat() {
        let body = br#"{"timing":{"interval":0,"repeat-for":10},"callback":{"http":{"uri":"http://x","opaque":"y"}}}"#;
        let err = from_json(1, 0, 0, 0, body).unwrap_err();
        assert!(matches!(err, Error::InvalidTiming { .. }));
    }

    #[test]
    fn round_trips_remaining_time() {
        let body = br#"{"timing":{"interval":5,"repeat-for":5},"callback":{"http":{"uri":"http://x","opaque":"y"}}}"#;
        let parsed = from_json(42, 0, 1_000, 0, body).unwrap();
        assert_eq!(parsed.timer.interval_ms, 5000);
        assert_eq!(parsed.timer.start_time_mono_ms, 1_000);

        let encoded = to_json(&parsed.timer, 1_500);
        let reparsed = from_json(42, 0, 1_500, 0, &encoded).unwrap();
        // remaining time from "now" (1_500) should match across both
        // representations: original implies next pop at 1_000+5000=6000,
        // i.e. 4500ms remaining from 1_500; reparsed must agree.
        let original_remaining = parsed.timer.next_pop_time("").wrapping_sub(1_500);
        let reparsed_remaining = reparsed.timer.next_pop_time("").wrapping_sub(1_500);
        assert_eq!(original_remaining, reparsed_remaining);
    }

    #[test]
    fn explicit_replicas_marks_replicated_inbound() {
        let body = br#"{"timing":{"interval":5},"callback":{"http":{"uri":"http://x","opaque":"y"}},"reliability":{"replicas":["a:1","b:2"]}}"#;
        let parsed = from_json(1, 0, 0, 0, body).unwrap();
        assert!(parsed.replicated);
        assert_eq!(parsed.timer.replicas, vec!["a:1", "b:2"]);
    }

    #[test]
    fn rejects_empty_explicit_replicas() {
        let body = br#"{"timing":{"interval":5},"callback":{"http":{"uri":"http://x","opaque":"y"}},"reliability":{"replicas":[]}}"#;
        let err = from_json(1, 0, 0, 0, body).unwrap_err();
        assert!(matches!(err, Error::InvalidReplicas(_)));
    }

    #[test]
    fn malformed_tag_info_entries_are_skipped_individually() {
        let body = br#"{"timing":{"interval":5},"callback":{"http":{"uri":"http://x","opaque":"y"}},"statistics":{"tag-info":[{"type":"a","count":1},{"type":"b"}]}}"#;
        let parsed = from_json(1, 0, 0, 0, body).unwrap();
        assert_eq!(parsed.timer.tags.len(), 1);
        assert_eq!(parsed.timer.tags.get("a"), Some(&1));
    }
}
