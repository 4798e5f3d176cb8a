//! Reconciliation scenarios against an in-memory group directory.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use sgtsync::controller::Reconciler;
use sgtsync::directory::{GroupDirectory, TagRecord};
use sgtsync::error::{Result, SgtSyncError};
use sgtsync::events::{Binding, EventSource};
use sgtsync::rate_meter::RateMeter;
use sgtsync::settings::CacheSettings;

#[derive(Debug)]
struct MockState {
    // tag id -> (name, ranges)
    tags: HashMap<String, (String, Vec<String>)>,
    next_id: u64,
    // remote calls in order: "create <name>", "fetch <id>", "add <id> <ip>",
    // "remove <id> <ip>"
    calls: Vec<String>,
    meter: RateMeter,
    forced_rate: Option<f64>,
    fail_fetches: usize,
    fail_create: bool,
}

#[derive(Clone)]
struct MockDirectory(Arc<Mutex<MockState>>);

impl MockDirectory {
    fn new(tags: Vec<(&str, &str, Vec<&str>)>) -> Self {
        let tags = tags
            .into_iter()
            .map(|(id, name, ranges)| {
                (
                    id.to_string(),
                    (
                        name.to_string(),
                        ranges.into_iter().map(str::to_string).collect(),
                    ),
                )
            })
            .collect();
        Self(Arc::new(Mutex::new(MockState {
            tags,
            next_id: 100,
            calls: Vec::new(),
            meter: RateMeter::default(),
            forced_rate: None,
            fail_fetches: 0,
            fail_create: false,
        })))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    fn writes(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.starts_with("add") || call.starts_with("remove"))
            .cloned()
            .collect()
    }

    fn ranges(&self, tag_id: &str) -> Vec<String> {
        self.state().tags.get(tag_id).unwrap().1.clone()
    }
}

#[async_trait]
impl GroupDirectory for MockDirectory {
    async fn resolve_tag_id(&mut self, name: &str) -> Result<Option<String>> {
        // local lookup, costs no remote call
        Ok(self
            .state()
            .tags
            .iter()
            .find(|(_, (tag_name, _))| tag_name == name)
            .map(|(id, _)| id.clone()))
    }

    async fn create_tag(&mut self, name: &str) -> Result<String> {
        let mut state = self.state();
        state.meter.monitor();
        state.calls.push(format!("create {}", name));
        if state.fail_create {
            return Err(SgtSyncError::TagResolution(format!(
                "cannot create {}",
                name
            )));
        }
        let id = state.next_id.to_string();
        state.next_id += 1;
        state.tags.insert(id.clone(), (name.to_string(), vec![]));
        Ok(id)
    }

    async fn fetch_tag_details(&mut self, tag_id: &str) -> Result<TagRecord> {
        let mut state = self.state();
        state.meter.monitor();
        state.calls.push(format!("fetch {}", tag_id));
        if state.fail_fetches > 0 {
            state.fail_fetches -= 1;
            return Err(SgtSyncError::RemoteFetch(format!(
                "fetch of {} failed",
                tag_id
            )));
        }
        let (name, ranges) = state
            .tags
            .get(tag_id)
            .cloned()
            .ok_or_else(|| SgtSyncError::RemoteFetch(format!("tag {} not found", tag_id)))?;
        TagRecord::from_value(json!({"id": tag_id, "name": name, "ranges": ranges}))
    }

    async fn add_ip_to_tag(&mut self, tag_id: &str, _details: &TagRecord, ip: &str) -> Result<()> {
        let mut state = self.state();
        state.meter.monitor();
        state.calls.push(format!("add {} {}", tag_id, ip));
        let (_, ranges) = state
            .tags
            .get_mut(tag_id)
            .ok_or_else(|| SgtSyncError::RemoteWrite(format!("tag {} not found", tag_id)))?;
        ranges.push(ip.to_string());
        Ok(())
    }

    async fn remove_ip_from_tag(
        &mut self,
        tag_id: &str,
        _details: &TagRecord,
        ip: &str,
    ) -> Result<()> {
        let mut state = self.state();
        state.meter.monitor();
        state.calls.push(format!("remove {} {}", tag_id, ip));
        let (_, ranges) = state
            .tags
            .get_mut(tag_id)
            .ok_or_else(|| SgtSyncError::RemoteWrite(format!("tag {} not found", tag_id)))?;
        ranges.retain(|range| range != ip);
        Ok(())
    }

    fn call_rate(&mut self) -> f64 {
        let mut state = self.state();
        if let Some(rate) = state.forced_rate {
            return rate;
        }
        state.meter.rate()
    }

    fn call_index(&self) -> u64 {
        self.state().meter.index()
    }
}

/// Event source replaying canned topic messages, then failing like a closed
/// websocket.
struct ScriptedSource {
    messages: VecDeque<String>,
}

impl ScriptedSource {
    fn new(messages: &[&str]) -> Self {
        Self {
            messages: messages.iter().map(|msg| msg.to_string()).collect(),
        }
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn next_message(&mut self) -> Result<String> {
        self.messages
            .pop_front()
            .ok_or_else(|| SgtSyncError::Transport("websocket connection closed".to_string()))
    }
}

fn binding(tag: &str, ips: &[&str]) -> Binding {
    Binding {
        tag_name: tag.to_string(),
        ip_addresses: ips.iter().map(|ip| ip.to_string()).collect(),
    }
}

/// Sweep policy that never fires within a test's lifetime.
fn no_sweep() -> CacheSettings {
    CacheSettings::default()
}

#[tokio::test]
async fn first_observation_adds_ip_to_group() {
    let directory = MockDirectory::new(vec![("7", "GuestWireless", vec![])]);
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());

    let count = reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.5"]))
        .await
        .unwrap();

    assert_eq!(count, 1);
    assert_eq!(directory.calls(), vec!["fetch 7", "add 7 10.1.1.5"]);
    assert_eq!(directory.ranges("7"), vec!["10.1.1.5"]);
    assert_eq!(
        reconciler.cache().lookup("10.1.1.5"),
        Some("7".to_string())
    );
}

#[tokio::test]
async fn repeated_event_makes_exactly_one_remote_write() {
    let directory = MockDirectory::new(vec![("7", "GuestWireless", vec![])]);
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());
    let event = binding("GuestWireless", &["10.1.1.5"]);

    reconciler.handle_binding(&event).await.unwrap();
    let before = reconciler.cache().last_confirmed("10.1.1.5").unwrap();
    let calls_after_first = directory.calls().len();

    // let the clock move so the confirmation is observable
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
    reconciler.handle_binding(&event).await.unwrap();

    // second pass took the confirm-only path: zero remote calls
    assert_eq!(directory.calls().len(), calls_after_first);
    assert_eq!(directory.writes().len(), 1);
    let after = reconciler.cache().last_confirmed("10.1.1.5").unwrap();
    assert!(after > before);
}

#[tokio::test]
async fn tag_move_adds_to_new_group_and_removes_from_old() {
    let directory = MockDirectory::new(vec![
        ("7", "GuestWireless", vec![]),
        ("9", "Quarantine", vec![]),
    ]);
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());

    reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.5"]))
        .await
        .unwrap();
    reconciler
        .handle_binding(&binding("Quarantine", &["10.1.1.5"]))
        .await
        .unwrap();

    // converged: cache follows the most recent event, console membership moved
    assert_eq!(
        reconciler.cache().lookup("10.1.1.5"),
        Some("9".to_string())
    );
    assert_eq!(directory.ranges("9"), vec!["10.1.1.5"]);
    assert!(directory.ranges("7").is_empty());
    assert_eq!(
        directory.calls(),
        vec![
            "fetch 7",
            "add 7 10.1.1.5",
            "fetch 9",
            "add 9 10.1.1.5",
            "fetch 7",
            "remove 7 10.1.1.5",
        ]
    );
}

#[tokio::test]
async fn tag_move_skips_removal_when_old_group_lacks_the_ip() {
    let directory = MockDirectory::new(vec![
        ("7", "GuestWireless", vec![]),
        ("9", "Quarantine", vec![]),
    ]);
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());

    reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.5"]))
        .await
        .unwrap();
    // the console lost the membership behind our back
    directory.state().tags.get_mut("7").unwrap().1.clear();

    reconciler
        .handle_binding(&binding("Quarantine", &["10.1.1.5"]))
        .await
        .unwrap();

    let removes: Vec<String> = directory
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("remove"))
        .collect();
    assert!(removes.is_empty());
    assert_eq!(
        reconciler.cache().lookup("10.1.1.5"),
        Some("9".to_string())
    );
}

#[tokio::test]
async fn ip_already_in_console_group_needs_no_write() {
    let directory = MockDirectory::new(vec![("7", "GuestWireless", vec!["10.1.1.5"])]);
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());

    reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.5"]))
        .await
        .unwrap();

    // one fetch to learn the truth, no mutation
    assert_eq!(directory.calls(), vec!["fetch 7"]);
    assert_eq!(
        reconciler.cache().lookup("10.1.1.5"),
        Some("7".to_string())
    );
}

#[tokio::test]
async fn range_fold_caches_other_group_members() {
    let directory = MockDirectory::new(vec![(
        "7",
        "GuestWireless",
        vec!["10.1.1.5", "10.1.1.6", "10.1.1.7"],
    )]);
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());

    reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.5"]))
        .await
        .unwrap();

    // the fetched ranges were folded in; later events for these IPs are
    // confirm-only
    assert_eq!(reconciler.cache().len(), 3);
    reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.6"]))
        .await
        .unwrap();
    assert_eq!(directory.calls(), vec!["fetch 7"]);
}

#[tokio::test]
async fn rate_gate_sheds_the_whole_event() {
    let directory = MockDirectory::new(vec![("7", "GuestWireless", vec![])]);
    directory.state().forced_rate = Some(50.0);
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());

    let err = reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.5"]))
        .await
        .unwrap_err();

    assert!(matches!(err, SgtSyncError::RateExceeded(_)));
    assert!(!err.is_fatal());
    // no cache mutation, no remote calls
    assert!(directory.calls().is_empty());
    assert!(reconciler.cache().is_empty());
}

#[tokio::test]
async fn unknown_tag_is_created_then_used() {
    let directory = MockDirectory::new(vec![]);
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());

    reconciler
        .handle_binding(&binding("NewSegment", &["10.9.9.9"]))
        .await
        .unwrap();

    assert_eq!(
        directory.calls(),
        vec!["create NewSegment", "fetch 100", "add 100 10.9.9.9"]
    );
    assert_eq!(
        reconciler.cache().lookup("10.9.9.9"),
        Some("100".to_string())
    );
}

#[tokio::test]
async fn failed_tag_creation_drops_the_event() {
    let directory = MockDirectory::new(vec![]);
    directory.state().fail_create = true;
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());

    let err = reconciler
        .handle_binding(&binding("NewSegment", &["10.9.9.9"]))
        .await
        .unwrap_err();

    assert!(matches!(err, SgtSyncError::TagResolution(_)));
    assert!(reconciler.cache().is_empty());
    // the create attempt was the only remote call
    assert_eq!(directory.calls(), vec!["create NewSegment"]);
}

#[tokio::test]
async fn fetch_failure_invalidates_only_the_affected_ip() {
    let directory = MockDirectory::new(vec![("7", "GuestWireless", vec![])]);
    directory.state().fail_fetches = 1;
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());

    let count = reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.5", "10.1.1.6"]))
        .await
        .unwrap();

    // both IPs were attempted; the first was invalidated, the second landed
    assert_eq!(count, 2);
    assert_eq!(reconciler.cache().lookup("10.1.1.5"), None);
    assert_eq!(
        reconciler.cache().lookup("10.1.1.6"),
        Some("7".to_string())
    );
    assert_eq!(directory.writes(), vec!["add 7 10.1.1.6"]);
}

#[tokio::test]
async fn empty_ip_strings_are_skipped() {
    let directory = MockDirectory::new(vec![("7", "GuestWireless", vec![])]);
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());

    let count = reconciler
        .handle_binding(&binding("GuestWireless", &["", "10.1.1.5", ""]))
        .await
        .unwrap();

    assert_eq!(count, 1);
    assert_eq!(directory.writes(), vec!["add 7 10.1.1.5"]);
}

#[tokio::test]
async fn stale_ips_are_swept_out_of_console_and_cache() {
    let directory = MockDirectory::new(vec![("7", "GuestWireless", vec![])]);
    let policy = CacheSettings {
        sweep_interval_seconds: 0,
        stale_after_seconds: 0,
        remove_stale: true,
    };
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, policy);

    reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.5"]))
        .await
        .unwrap();

    // age the first binding past the (zero) staleness threshold
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

    reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.6"]))
        .await
        .unwrap();

    // the sweep after the second IP retired the first one
    assert_eq!(reconciler.cache().lookup("10.1.1.5"), None);
    assert_eq!(
        reconciler.cache().lookup("10.1.1.6"),
        Some("7".to_string())
    );
    assert_eq!(directory.ranges("7"), vec!["10.1.1.6"]);
    assert!(directory
        .calls()
        .contains(&"remove 7 10.1.1.5".to_string()));
}

#[tokio::test]
async fn run_consumes_the_stream_until_the_transport_fails() {
    let directory = MockDirectory::new(vec![("7", "GuestWireless", vec![])]);
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, no_sweep());
    let mut source = ScriptedSource::new(&[
        // a usable binding
        r#"{"sessions": [{"ctsSecurityGroup": "GuestWireless", "ipAddresses": ["10.1.1.5"]}]}"#,
        // ignorable: no security group on the session
        r#"{"sessions": [{"ipAddresses": ["10.1.1.9"]}]}"#,
        // undecodable: ignored as well
        "not json",
    ]);

    let err = reconciler.run(&mut source).await.unwrap_err();
    assert!(err.is_fatal());

    // the one real binding was applied, the noise was not
    assert_eq!(
        reconciler.cache().lookup("10.1.1.5"),
        Some("7".to_string())
    );
    assert_eq!(reconciler.cache().len(), 1);
    assert_eq!(directory.writes(), vec!["add 7 10.1.1.5"]);
}

#[tokio::test]
async fn sweep_reports_but_keeps_entries_when_removal_disabled() {
    let directory = MockDirectory::new(vec![("7", "GuestWireless", vec![])]);
    let policy = CacheSettings {
        sweep_interval_seconds: 0,
        stale_after_seconds: 0,
        remove_stale: false,
    };
    let mut reconciler = Reconciler::new(directory.clone(), 20.0, policy);

    reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.5"]))
        .await
        .unwrap();
    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
    reconciler
        .handle_binding(&binding("GuestWireless", &["10.1.1.6"]))
        .await
        .unwrap();

    // stale entry stays everywhere
    assert_eq!(
        reconciler.cache().lookup("10.1.1.5"),
        Some("7".to_string())
    );
    assert!(directory
        .ranges("7")
        .contains(&"10.1.1.5".to_string()));
    assert!(!directory
        .calls()
        .iter()
        .any(|call| call.starts_with("remove")));
}
