//! Stale-entry sweep: remove IPs the identity source stopped confirming.
use chrono::Utc;

use crate::cache::IpTagCache;
use crate::directory::GroupDirectory;
use crate::settings::CacheSettings;
use tracing::{debug, info, warn};

/// Run one sweep pass. The cache gates on its own sweep interval, so calling
/// this after every reconciled IP is cheap; most calls return immediately.
///
/// When removal is disabled the stale set is only reported; entries stay in
/// the cache and will be reconsidered at the next interval.
/// Returns the number of entries actually removed.
pub async fn run_sweep<D: GroupDirectory>(
    cache: &mut IpTagCache,
    directory: &mut D,
    policy: &CacheSettings,
) -> usize {
    let stale = cache.sweep(policy.stale_after_seconds, policy.sweep_interval_seconds);
    if stale.is_empty() {
        return 0;
    }
    if !policy.remove_stale {
        info!(
            count = stale.len(),
            "stale cache entries found; removal disabled, leaving in place"
        );
        for ip in &stale {
            debug!(ip = ip.as_str(), "stale entry kept");
        }
        return 0;
    }

    let now = Utc::now().timestamp();
    let mut removed = 0;
    for ip in &stale {
        let Some(tag_id) = cache.lookup(ip) else {
            continue;
        };
        let age = now - cache.last_confirmed(ip).unwrap_or(now);
        match directory.fetch_tag_details(&tag_id).await {
            Ok(details) => {
                info!(
                    ip = ip.as_str(),
                    tag = details.name.as_str(),
                    age_seconds = age,
                    rate = directory.call_rate(),
                    "stale IP, removing from group"
                );
                if let Err(err) = directory.remove_ip_from_tag(&tag_id, &details, ip).await {
                    // cache entry goes regardless; a restart re-derives truth
                    warn!(ip = ip.as_str(), error = %err, "stale removal failed in console");
                }
                cache.delete(ip);
                removed += 1;
            }
            Err(err) => {
                warn!(
                    ip = ip.as_str(),
                    tag = tag_id.as_str(),
                    error = %err,
                    "cannot fetch tag for stale IP, dropping cache entry"
                );
                cache.delete(ip);
                removed += 1;
            }
        }
    }
    removed
}
