//! Event-driven reconciliation core.
//!
//! One binding event at a time: consult the cache, decide which console
//! mutations are actually needed, apply them, keep the cache current, and
//! opportunistically sweep. Events are never queued or retried — under rate
//! pressure the whole event is shed, and convergence is restored by later
//! traffic or the sweep.
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cache::IpTagCache;
use crate::directory::GroupDirectory;
use crate::error::{Result, SgtSyncError};
use crate::events::{parse_binding, Binding, EventSource};
use crate::rate_meter::RateMeter;
use crate::settings::CacheSettings;
use crate::sweep;

pub struct Reconciler<D: GroupDirectory> {
    directory: D,
    cache: IpTagCache,
    cache_policy: CacheSettings,
    /// Console calls per second above which whole events are shed
    max_call_rate: f64,
    /// Every frame received off the topic
    raw_meter: RateMeter,
    /// Frames that carried a usable binding
    binding_meter: RateMeter,
}

impl<D: GroupDirectory> Reconciler<D> {
    pub fn new(directory: D, max_call_rate: f64, cache_policy: CacheSettings) -> Self {
        Self {
            directory,
            cache: IpTagCache::new(),
            cache_policy,
            max_call_rate,
            raw_meter: RateMeter::default(),
            binding_meter: RateMeter::default(),
        }
    }

    pub fn cache(&self) -> &IpTagCache {
        &self.cache
    }

    /// Consume the event stream until the transport fails. Only transport
    /// errors terminate; per-event failures are reported and dropped.
    pub async fn run<S: EventSource>(&mut self, source: &mut S) -> Result<()> {
        loop {
            let body = source.next_message().await?;
            self.raw_meter.monitor();
            let Some(binding) = parse_binding(&body) else {
                continue;
            };
            match self.handle_binding(&binding).await {
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(tag = binding.tag_name.as_str(), error = %err, "event dropped"),
            }
        }
    }

    /// Process one binding per the reconciliation algorithm. Returns how many
    /// IPs were attempted, or the error that caused the event to be dropped.
    pub async fn handle_binding(&mut self, binding: &Binding) -> Result<usize> {
        self.binding_meter.monitor();
        info!(
            event = self.binding_meter.index(),
            console_calls = self.directory.call_index(),
            tag = binding.tag_name.as_str(),
            ips = %binding.ip_addresses.join(" "),
            raw_rate = %format!("{:.1}", self.raw_meter.rate()),
            binding_rate = %format!("{:.1}", self.binding_meter.rate()),
            "binding received"
        );

        // backpressure policy: shed the whole event, do not queue
        let call_rate = self.directory.call_rate();
        if call_rate > self.max_call_rate {
            return Err(SgtSyncError::RateExceeded(call_rate));
        }

        let tag_id = match self.directory.resolve_tag_id(&binding.tag_name).await? {
            Some(tag_id) => tag_id,
            None => {
                info!(
                    tag = binding.tag_name.as_str(),
                    rate = %format!("{:.1}", self.directory.call_rate()),
                    "new tag, creating in console"
                );
                self.directory
                    .create_tag(&binding.tag_name)
                    .await
                    .map_err(|err| {
                        error!(tag = binding.tag_name.as_str(), error = %err, "tag creation failed");
                        SgtSyncError::TagResolution(format!(
                            "cannot create tag {}",
                            binding.tag_name
                        ))
                    })?
            }
        };

        let mut reconciled = 0;
        for ip in &binding.ip_addresses {
            if ip.is_empty() {
                continue;
            }
            self.reconcile_ip(&binding.tag_name, &tag_id, ip).await;
            reconciled += 1;
            // amortize cleanup across normal traffic; gated inside the cache
            sweep::run_sweep(&mut self.cache, &mut self.directory, &self.cache_policy).await;
        }
        Ok(reconciled)
    }

    /// Reconcile one IP against one tag. Remote failures here affect only
    /// this IP; the caller proceeds with the rest of the event.
    async fn reconcile_ip(&mut self, tag_name: &str, tag_id: &str, ip: &str) {
        let now = Utc::now().timestamp();
        let cached = self.cache.lookup(ip);
        if cached.as_deref() == Some(tag_id) {
            let age_minutes = (now - self.cache.last_confirmed(ip).unwrap_or(now)) / 60;
            debug!(
                tag = tag_name,
                ip,
                age_minutes,
                "present in cache with the same tag, confirming"
            );
            self.cache.confirm(ip);
            return;
        }

        // optimistic: the cache asserts the new binding before the console
        // write lands; a failed write is reconciled by later traffic
        let previous = self.cache.upsert(ip, tag_id);

        let details = match self.directory.fetch_tag_details(tag_id).await {
            Ok(details) => details,
            Err(err) => {
                warn!(tag = tag_name, ip, error = %err, "tag fetch failed, invalidating cache entry");
                self.cache.delete(ip);
                return;
            }
        };

        match &details.ranges {
            Some(ranges) => {
                self.cache.sync_from_tag(tag_id, ranges);
                if details.contains(ip) {
                    let age_minutes = (now - self.cache.last_confirmed(ip).unwrap_or(now)) / 60;
                    info!(
                        tag = tag_name,
                        ip,
                        age_minutes,
                        rate = %format!("{:.1}", self.directory.call_rate()),
                        "already present in console group"
                    );
                } else {
                    info!(
                        tag = tag_name,
                        ip,
                        rate = %format!("{:.1}", self.directory.call_rate()),
                        "not in console group, adding"
                    );
                    if let Err(err) = self.directory.add_ip_to_tag(tag_id, &details, ip).await {
                        warn!(tag = tag_name, ip, error = %err, "console add failed");
                    }
                }
            }
            None => warn!(tag = tag_name, ip, "tag details carry no range list"),
        }

        let Some(previous_tag) = previous else {
            return;
        };
        match self.directory.fetch_tag_details(&previous_tag).await {
            Ok(prev_details) => {
                if let Some(ranges) = &prev_details.ranges {
                    // fold what the console knows about the old group, minus
                    // the IP that is moving out of it
                    let others: Vec<String> = ranges
                        .iter()
                        .filter(|range| range.as_str() != ip)
                        .cloned()
                        .collect();
                    self.cache.sync_from_tag(&previous_tag, &others);
                }
                if prev_details.contains(ip) {
                    info!(
                        old_tag = prev_details.name.as_str(),
                        ip,
                        rate = %format!("{:.1}", self.directory.call_rate()),
                        "present in old console group, removing"
                    );
                    if let Err(err) = self
                        .directory
                        .remove_ip_from_tag(&previous_tag, &prev_details, ip)
                        .await
                    {
                        warn!(old_tag = previous_tag.as_str(), ip, error = %err, "console remove failed");
                    }
                } else {
                    debug!(
                        old_tag = prev_details.name.as_str(),
                        ip, "not present in old console group, no change"
                    );
                }
            }
            Err(err) => {
                warn!(old_tag = previous_tag.as_str(), ip, error = %err, "old tag fetch failed, skipping removal");
            }
        }
    }
}
