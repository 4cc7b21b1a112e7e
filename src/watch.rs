//! Watch loop: periodically syncs rules, forwarding whatever arrived since
//! the stored cursor.
//!
//! `sync_rule` never returns an error; every failure ends up inside the
//! [`SyncResult`] so one bad rule cannot take the loop down.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::client::ChatClient;
use crate::config;
use crate::db::{self, Pool};
use crate::error::Result;
use crate::filter::{FilterConfig, MessageFilter};
use crate::forwarder::MessageForwarder;
use crate::model::{Rule, SyncResult, WatchStatus};
use crate::resolve;
use crate::retry::{self, RetryPolicy};

/// Settings key holding the JSON-encoded global filter config.
pub const SETTING_GLOBAL_FILTERS: &str = "global_filters";

pub struct WatchService {
    pool: Pool,
    client: Arc<dyn ChatClient>,
    watch: config::Watch,
    retry_policy: RetryPolicy,
    namespace: String,
    temp_dir: PathBuf,
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

/// Sleep window before the next sync pass: the rule's own interval, or the
/// shortest enabled interval when syncing everything.
fn interval_for(rules: &[Rule], default_minutes: u64) -> Duration {
    let minutes = rules
        .iter()
        .filter(|r| r.enabled)
        .map(|r| r.interval_minutes.max(1) as u64)
        .min()
        .unwrap_or(default_minutes.max(1));
    Duration::from_secs(minutes * 60)
}

impl WatchService {
    pub fn new(pool: Pool, client: Arc<dyn ChatClient>, cfg: &config::Config) -> Self {
        Self {
            pool,
            client,
            watch: cfg.watch.clone(),
            retry_policy: RetryPolicy::from(&cfg.retry),
            namespace: cfg.app.namespace.clone(),
            temp_dir: cfg.temp_dir(),
            cancel: CancellationToken::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sync a single rule once. All failures are captured in the result.
    #[instrument(skip(self))]
    pub async fn sync_rule(&self, name: &str) -> SyncResult {
        match self.sync_rule_inner(name).await {
            Ok(result) => result,
            Err(err) => {
                warn!(rule = name, error = %err, "sync failed");
                SyncResult::with_error(name, err.to_string())
            }
        }
    }

    async fn sync_rule_inner(&self, name: &str) -> Result<SyncResult> {
        let Some(rule) = db::get_rule(&self.pool, name).await? else {
            return Ok(SyncResult::with_error(name, "rule not found"));
        };
        if !rule.enabled {
            return Ok(SyncResult::with_error(name, "rule is disabled"));
        }

        let source = resolve::resolve(self.client.as_ref(), &rule.source_chat).await?;
        let target = resolve::resolve(self.client.as_ref(), &rule.target_chat).await?;

        let cursor = db::get_state(&self.pool, rule.id, &self.namespace)
            .await?
            .map(|s| s.last_msg_id)
            .unwrap_or(0);

        let mut result = SyncResult::new(name);

        // First sync: place the cursor at the newest message and forward
        // nothing, so enabling a rule never replays channel history.
        if cursor == 0 {
            let latest = self
                .client
                .fetch_messages(&source, 0, Some(1), false)
                .await?;
            let latest_id = latest.first().map(|m| m.id).unwrap_or(0);
            db::update_state(&self.pool, rule.id, &self.namespace, latest_id, 0).await?;
            result.new_last_msg_id = latest_id;
            info!(rule = name, latest_id, "initialized cursor");
            return Ok(result);
        }

        let messages = self
            .client
            .fetch_messages(&source, cursor, None, true)
            .await?;
        result.messages_found = messages.len();
        if messages.is_empty() {
            result.new_last_msg_id = cursor;
            return Ok(result);
        }

        let filter = self.load_filter(&rule).await?;
        let forwarder = MessageForwarder::new(self.client.as_ref(), self.temp_dir.clone());

        let mut new_last = cursor;
        let mut forwarded_groups: HashSet<i64> = HashSet::new();
        let total = messages.len();

        for (i, msg) in messages.iter().enumerate() {
            new_last = new_last.max(msg.id);

            // Later members of an already-forwarded album only move the
            // cursor.
            if let Some(gid) = msg.grouped_id {
                if forwarded_groups.contains(&gid) {
                    continue;
                }
            }

            let (pass, reason) = filter.should_forward(&msg.text);
            if !pass {
                let reason = reason.as_deref().unwrap_or("filtered");
                info!(rule = name, msg_id = msg.id, reason, "message skipped");
                result.messages_skipped += 1;
                continue;
            }

            // The retry wrapper replays flood waits only; ordinary failures
            // come back inside the result and are counted, not retried.
            if let Some(gid) = msg.grouped_id {
                forwarded_groups.insert(gid);
                let members = match forwarder.get_grouped_messages(msg, &source).await {
                    Ok(members) => members,
                    Err(err) => {
                        warn!(rule = name, msg_id = msg.id, error = %err, "album fetch failed");
                        result.messages_failed += 1;
                        continue;
                    }
                };
                let sent = retry::retry(&self.retry_policy, || {
                    forwarder.forward_album(&members, &source, &target, rule.mode)
                })
                .await;
                match sent {
                    Ok(ids) => {
                        result.messages_forwarded += ids.len();
                        for m in &members {
                            new_last = new_last.max(m.id);
                        }
                    }
                    Err(err) => {
                        warn!(rule = name, msg_id = msg.id, error = %err, "album forward failed");
                        result.messages_failed += members.len();
                    }
                }
            } else {
                let sent = retry::retry(&self.retry_policy, || {
                    forwarder.forward_message(msg, &source, &target, rule.mode, true)
                })
                .await;
                match sent {
                    Ok(res) if res.success => result.messages_forwarded += 1,
                    Ok(res) => {
                        let error = res.error.as_deref().unwrap_or("unknown");
                        info!(rule = name, msg_id = msg.id, error, "not forwarded");
                        result.messages_failed += 1;
                    }
                    Err(err) => {
                        warn!(rule = name, msg_id = msg.id, error = %err, "forward failed");
                        result.messages_failed += 1;
                    }
                }
            }

            // Pace the burst; no delay after the last message. A stop
            // request lets the in-flight message finish, then bails out.
            if i + 1 < total {
                let delay = self.message_delay();
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        result.new_last_msg_id = new_last;
        db::update_state(
            &self.pool,
            rule.id,
            &self.namespace,
            new_last,
            result.messages_forwarded as i64,
        )
        .await?;
        Ok(result)
    }

    fn message_delay(&self) -> Duration {
        let min = self.watch.message_delay_min_secs;
        let max = self.watch.message_delay_max_secs;
        let secs = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    async fn load_filter(&self, rule: &Rule) -> Result<MessageFilter> {
        let global = db::get_setting(&self.pool, SETTING_GLOBAL_FILTERS)
            .await?
            .map(|json| FilterConfig::from_json(&json))
            .unwrap_or_default();
        let rule_filters = rule
            .filter_spec
            .as_deref()
            .map(FilterConfig::from_json)
            .unwrap_or_default();
        Ok(MessageFilter::new(rule_filters, global))
    }

    /// Sync every enabled rule once, sequentially.
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> Result<Vec<SyncResult>> {
        let rules = db::get_all_rules(&self.pool, true).await?;
        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            results.push(self.sync_rule(&rule.name).await);
        }
        Ok(results)
    }

    /// Run the watch loop until [`stop`](Self::stop) is called. With a rule
    /// name, watches just that rule; otherwise all enabled rules. `on_sync`
    /// sees each sync result as it happens.
    pub async fn watch<F>(&self, rule_name: Option<&str>, mut on_sync: F) -> Result<()>
    where
        F: FnMut(&SyncResult),
    {
        self.running.store(true, Ordering::SeqCst);
        info!(rule = rule_name.unwrap_or("*"), "watch loop started");

        loop {
            let interval = match rule_name {
                Some(name) => {
                    let result = self.sync_rule(name).await;
                    on_sync(&result);
                    match db::get_rule(&self.pool, name).await? {
                        Some(rule) => interval_for(
                            std::slice::from_ref(&rule),
                            self.watch.default_interval_minutes,
                        ),
                        None => interval_for(&[], self.watch.default_interval_minutes),
                    }
                }
                None => {
                    for result in self.sync_all().await? {
                        on_sync(&result);
                    }
                    let rules = db::get_all_rules(&self.pool, true).await?;
                    interval_for(&rules, self.watch.default_interval_minutes)
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("watch loop stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot every rule's sync state for status displays.
    pub async fn get_status(&self) -> Result<Vec<WatchStatus>> {
        let rules = db::get_all_rules(&self.pool, false).await?;
        let mut out = Vec::with_capacity(rules.len());
        for rule in rules {
            let state = db::get_state(&self.pool, rule.id, &self.namespace).await?;
            out.push(WatchStatus {
                rule_name: rule.name,
                source_chat: rule.source_chat,
                target_chat: rule.target_chat,
                last_msg_id: state.as_ref().map(|s| s.last_msg_id).unwrap_or(0),
                total_forwarded: state.as_ref().map(|s| s.total_forwarded).unwrap_or(0),
                last_sync_at: state.and_then(|s| s.last_sync_at),
                is_running: self.is_running(),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ForwardMode;
    use chrono::Utc;

    fn rule(name: &str, interval: i64, enabled: bool) -> Rule {
        Rule {
            id: 1,
            name: name.into(),
            source_chat: "a".into(),
            target_chat: "b".into(),
            mode: ForwardMode::Clone,
            interval_minutes: interval,
            enabled,
            filter_spec: None,
            note: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn shortest_enabled_interval_wins() {
        let rules = vec![rule("a", 30, true), rule("b", 5, true), rule("c", 1, false)];
        assert_eq!(interval_for(&rules, 60), Duration::from_secs(5 * 60));
    }

    #[test]
    fn empty_rule_set_uses_default() {
        assert_eq!(interval_for(&[], 45), Duration::from_secs(45 * 60));
        let disabled = vec![rule("a", 5, false)];
        assert_eq!(interval_for(&disabled, 45), Duration::from_secs(45 * 60));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let rules = vec![rule("a", 0, true)];
        assert_eq!(interval_for(&rules, 30), Duration::from_secs(60));
    }
}
