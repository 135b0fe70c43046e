//! Consumer-side processing of one queue envelope.
//!
//! The dispatcher's dedup check is the authoritative one. Plugins run on their
//! own task under a timeout so a panic or a hang is contained to one envelope.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::dedup::{DedupStatus, Deduplicator};
use crate::error::ProcessingError;
use crate::event::{normalize_text, DedupKey, EventKind, Scope};
use crate::platform::{Destination, ResponseSender};
use crate::plugins::{Captures, PluginInput, PluginResponse, PluginRouter, PluginSummary};
use crate::queue::QueueEnvelope;

const UNMATCHED_HINT: &str = "Sorry, I didn't understand that. Try `help` to see what I can do.";

/// Result of processing one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Handled (a response may or may not have been sent)
    Delivered,
    /// Already processed within the retention window
    Suppressed,
    Failed(ProcessingError),
}

/// What to do when no plugin matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedPolicy {
    /// Reply with a pointer to `help`
    #[default]
    Hint,
    /// Do nothing
    Silent,
}

/// Side-effect-free routing answer for the debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct RouteReport {
    pub text: String,
    pub scope: Scope,
    pub plugin: Option<String>,
    pub matched: Option<String>,
    pub captures: Option<Captures>,
}

pub struct Dispatcher {
    dedup: Arc<Deduplicator>,
    router: PluginRouter,
    sender: Arc<dyn ResponseSender>,
    unmatched: UnmatchedPolicy,
    plugin_timeout: Duration,
    catalog: Arc<[PluginSummary]>,
}

impl Dispatcher {
    pub fn new(
        dedup: Arc<Deduplicator>,
        router: PluginRouter,
        sender: Arc<dyn ResponseSender>,
        unmatched: UnmatchedPolicy,
        plugin_timeout: Duration,
    ) -> Self {
        let catalog = router.registry().summaries();
        Self {
            dedup,
            router,
            sender,
            unmatched,
            plugin_timeout,
            catalog,
        }
    }

    /// Process one dequeued envelope.
    pub async fn process(&self, envelope: &QueueEnvelope) -> Outcome {
        let Some(key) = envelope.key() else {
            error!(channel = %envelope.channel, "envelope without dedup key");
            return Outcome::Failed(ProcessingError::NonRetryable("envelope has no dedup key".to_string()));
        };

        match self.dedup.check_and_mark(&key).await {
            Ok(DedupStatus::AlreadySeen) => {
                info!(dedup_key = %key, attempt = envelope.attempt, "duplicate suppressed at dispatch");
                return Outcome::Suppressed;
            }
            Ok(DedupStatus::FirstSeen) => {}
            Err(e) => {
                warn!(dedup_key = %key, error = %e, "dedup store unavailable");
                return Outcome::Failed(ProcessingError::Retryable(format!("dedup store unavailable: {}", e)));
            }
        }

        match self.handle(envelope, &key).await {
            Ok(()) => Outcome::Delivered,
            Err(err) => {
                if err.is_retryable() {
                    // Let the redelivery through the dedup check.
                    if let Err(e) = self.dedup.release(&key).await {
                        warn!(dedup_key = %key, error = %e, "failed to release dispatch mark");
                    }
                }
                Outcome::Failed(err)
            }
        }
    }

    async fn handle(&self, envelope: &QueueEnvelope, key: &DedupKey) -> Result<(), ProcessingError> {
        let Some(found) = self.router.route(&envelope.text, envelope.scope()) else {
            return self.unmatched(envelope, key).await;
        };

        let plugin = found.plugin.name().to_string();
        info!(
            dedup_key = %key,
            plugin = %plugin,
            attempt = envelope.attempt,
            channel = %envelope.channel,
            "dispatching to plugin"
        );

        let input = PluginInput {
            event: envelope.clone(),
            matched: found.matched,
            captures: found.captures,
            catalog: self.catalog.clone(),
        };
        let handler = found.plugin.handler.clone();
        let mut task = tokio::spawn(async move { handler.process(input).await });

        let response = match tokio::time::timeout(self.plugin_timeout, &mut task).await {
            Err(_) => {
                task.abort();
                return Err(ProcessingError::Retryable(format!(
                    "plugin '{}' timed out after {:?}",
                    plugin, self.plugin_timeout
                )));
            }
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(plugin = %plugin, dedup_key = %key, "plugin panicked");
                return Err(ProcessingError::NonRetryable(format!("plugin '{}' panicked", plugin)));
            }
            Ok(Err(join_err)) => {
                return Err(ProcessingError::Retryable(format!("plugin '{}' task failed: {}", plugin, join_err)));
            }
            Ok(Ok(Err(plugin_err))) => {
                warn!(plugin = %plugin, dedup_key = %key, error = %plugin_err, "plugin failed");
                return Err(plugin_err.into());
            }
            Ok(Ok(Ok(response))) => response,
        };

        match response {
            Some(response) => {
                self.send(envelope, &response).await?;
                self.send_additional(envelope, &response).await;
                Ok(())
            }
            None => {
                debug!(plugin = %plugin, "plugin produced no response");
                Ok(())
            }
        }
    }

    async fn unmatched(&self, envelope: &QueueEnvelope, key: &DedupKey) -> Result<(), ProcessingError> {
        debug!(dedup_key = %key, policy = ?self.unmatched, "no plugin matched");
        // Reactions are ambient; never answer an unrecognised one.
        if self.unmatched == UnmatchedPolicy::Silent || envelope.kind == EventKind::Reaction {
            return Ok(());
        }
        self.send(envelope, &PluginResponse::text(UNMATCHED_HINT)).await
    }

    async fn send(&self, envelope: &QueueEnvelope, response: &PluginResponse) -> Result<(), ProcessingError> {
        let destination = Destination::resolve(envelope, response);
        self.sender
            .send(&destination, response)
            .await
            .map_err(|e| ProcessingError::Retryable(format!("response send failed: {}", e)))
    }

    /// Follow-ups are best effort: the primary reply is out, and a retry would
    /// post it twice.
    async fn send_additional(&self, envelope: &QueueEnvelope, response: &PluginResponse) {
        for (index, extra) in response.additional.iter().enumerate() {
            let destination = Destination::resolve(envelope, extra);
            match self.sender.send(&destination, extra).await {
                Ok(()) => debug!(channel = %destination.channel, index, "additional response sent"),
                Err(e) => warn!(
                    dedup_key = %envelope.dedup_key,
                    channel = %destination.channel,
                    index,
                    error = %e,
                    "additional response failed"
                ),
            }
        }
    }

    /// Show which plugin `text` would reach, without invoking it.
    pub fn dry_run(&self, text: &str, scope: Scope) -> RouteReport {
        let text = normalize_text(text);
        let found = self.router.route(&text, scope);
        RouteReport {
            scope,
            plugin: found.as_ref().map(|m| m.plugin.name().to_string()),
            matched: found.as_ref().map(|m| m.matched.clone()),
            captures: found.map(|m| m.captures),
            text,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dedup::{MemoryDedupStore, Stage};
    use crate::error::SendError;
    use crate::plugins::builtin::IncidentPlugin;
    use crate::plugins::{
        HandlerCatalog, PatternType, Plugin, PluginDescriptor, PluginError, PluginRegistry, ResponseTarget,
    };
    use crate::queue::tests::envelope;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Sender double that records what would have been posted.
    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub(crate) sent: Mutex<Vec<(Destination, PluginResponse)>>,
        pub(crate) fail: AtomicBool,
        /// Channel the platform refuses to post to
        pub(crate) rejected_channel: Mutex<Option<String>>,
    }

    #[async_trait]
    impl ResponseSender for RecordingSender {
        async fn send(&self, destination: &Destination, response: &PluginResponse) -> Result<(), SendError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SendError::Api("channel_not_found".to_string()));
            }
            if self.rejected_channel.lock().await.as_deref() == Some(destination.channel.as_str()) {
                return Err(SendError::Api("not_in_channel".to_string()));
            }
            self.sent.lock().await.push((destination.clone(), response.clone()));
            Ok(())
        }
    }

    pub(crate) enum Behavior {
        Reply(&'static str),
        /// Thread reply, then a channel post and a DM
        Fanout,
        Incident,
        Transient,
        Fatal,
        Panic,
        Hang,
    }

    /// Plugin double that counts invocations and records captures.
    pub(crate) struct ScriptedPlugin {
        behavior: Behavior,
        pub(crate) calls: AtomicUsize,
        pub(crate) captures: Mutex<Vec<Captures>>,
    }

    impl ScriptedPlugin {
        pub(crate) fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
                captures: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Plugin for ScriptedPlugin {
        async fn process(&self, input: PluginInput) -> Result<Option<PluginResponse>, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.captures.lock().await.push(input.captures.clone());
            match self.behavior {
                Behavior::Reply(text) => Ok(Some(PluginResponse::text(text))),
                Behavior::Fanout => Ok(Some(
                    PluginResponse::text("escalated")
                        .also(PluginResponse::text("incident escalated").in_channel("COPS"))
                        .also(PluginResponse::text("you are on call").to(ResponseTarget::DirectMessage)),
                )),
                Behavior::Incident => IncidentPlugin.process(input).await,
                Behavior::Transient => Err(PluginError::Transient("upstream 503".to_string())),
                Behavior::Fatal => Err(PluginError::Fatal("bad input".to_string())),
                Behavior::Panic => panic!("plugin bug"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(None)
                }
            }
        }
    }

    /// Dispatcher over regex plugins `(name, pattern, handler)` in order.
    pub(crate) fn dispatcher(
        plugins: Vec<(&str, &str, Arc<dyn Plugin>)>,
        sender: Arc<RecordingSender>,
        unmatched: UnmatchedPolicy,
    ) -> Dispatcher {
        let mut catalog = HandlerCatalog::new();
        let mut descriptors = Vec::new();
        for (name, pattern, handler) in plugins {
            catalog.register(name, handler);
            descriptors.push(PluginDescriptor {
                name: name.to_string(),
                patterns: vec![pattern.to_string()],
                pattern_type: PatternType::Regex,
                enabled: true,
                scope: Scope::Any,
                description: String::new(),
                handler: None,
            });
        }
        let registry = Arc::new(PluginRegistry::load(&descriptors, &catalog).unwrap());
        let dedup = Arc::new(Deduplicator::new(
            Arc::new(MemoryDedupStore::new()),
            Stage::Dispatch,
            chrono::Duration::seconds(300),
        ));
        Dispatcher::new(
            dedup,
            PluginRouter::new(registry),
            sender,
            unmatched,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_duplicate_delivery_invokes_plugin_once() {
        let incident = ScriptedPlugin::new(Behavior::Incident);
        let sender = Arc::new(RecordingSender::default());
        let d = dispatcher(
            vec![("incident", r"incident\s+(?P<id>\d+)", incident.clone() as Arc<dyn Plugin>)],
            sender.clone(),
            UnmatchedPolicy::Hint,
        );

        let env = envelope("src:evt1", "incident 456");
        assert_eq!(d.process(&env).await, Outcome::Delivered);
        assert_eq!(d.process(&env).await, Outcome::Suppressed);

        assert_eq!(incident.calls.load(Ordering::SeqCst), 1);
        assert_eq!(incident.captures.lock().await[0].name("id"), Some("456"));
        let sent = sender.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.text.starts_with("Incident #456"));
    }

    #[tokio::test]
    async fn test_ping_gets_fixed_reply_in_channel() {
        let sender = Arc::new(RecordingSender::default());
        let d = dispatcher(
            vec![("ping", "ping", Arc::new(crate::plugins::builtin::PingPlugin) as Arc<dyn Plugin>)],
            sender.clone(),
            UnmatchedPolicy::Hint,
        );
        assert_eq!(d.process(&envelope("src:p1", "ping")).await, Outcome::Delivered);

        let sent = sender.sent.lock().await;
        assert_eq!(sent[0].1.text, "Pong!");
        assert_eq!(sent[0].0, Destination { channel: "C123".to_string(), thread: None });
    }

    #[tokio::test]
    async fn test_unmatched_hint_and_silent() {
        let sender = Arc::new(RecordingSender::default());
        let d = dispatcher(vec![], sender.clone(), UnmatchedPolicy::Hint);
        assert_eq!(d.process(&envelope("src:u1", "what's up")).await, Outcome::Delivered);
        assert!(sender.sent.lock().await[0].1.text.contains("help"));

        let quiet = Arc::new(RecordingSender::default());
        let d = dispatcher(vec![], quiet.clone(), UnmatchedPolicy::Silent);
        assert_eq!(d.process(&envelope("src:u2", "what's up")).await, Outcome::Delivered);
        assert!(quiet.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retryable_and_released() {
        let flaky = ScriptedPlugin::new(Behavior::Transient);
        let d = dispatcher(
            vec![("flaky", "flaky", flaky.clone() as Arc<dyn Plugin>)],
            Arc::new(RecordingSender::default()),
            UnmatchedPolicy::Hint,
        );
        let env = envelope("src:t1", "flaky");

        for _ in 0..2 {
            match d.process(&env).await {
                Outcome::Failed(err) => assert!(err.is_retryable()),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retryable() {
        let d = dispatcher(
            vec![("bad", "bad", ScriptedPlugin::new(Behavior::Fatal) as Arc<dyn Plugin>)],
            Arc::new(RecordingSender::default()),
            UnmatchedPolicy::Hint,
        );
        let env = envelope("src:f1", "bad");
        assert!(matches!(d.process(&env).await, Outcome::Failed(ProcessingError::NonRetryable(_))));
        // Mark kept: a redelivery is suppressed.
        assert_eq!(d.process(&env).await, Outcome::Suppressed);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let d = dispatcher(
            vec![("buggy", "boom", ScriptedPlugin::new(Behavior::Panic) as Arc<dyn Plugin>)],
            Arc::new(RecordingSender::default()),
            UnmatchedPolicy::Hint,
        );
        assert!(matches!(
            d.process(&envelope("src:x1", "boom")).await,
            Outcome::Failed(ProcessingError::NonRetryable(_))
        ));
    }

    #[tokio::test]
    async fn test_hung_plugin_times_out_retryable() {
        let d = dispatcher(
            vec![("slow", "slow", ScriptedPlugin::new(Behavior::Hang) as Arc<dyn Plugin>)],
            Arc::new(RecordingSender::default()),
            UnmatchedPolicy::Hint,
        );
        assert!(matches!(
            d.process(&envelope("src:s1", "slow")).await,
            Outcome::Failed(ProcessingError::Retryable(_))
        ));
    }

    #[tokio::test]
    async fn test_send_failure_is_retryable() {
        let sender = Arc::new(RecordingSender::default());
        sender.fail.store(true, Ordering::SeqCst);
        let ok = ScriptedPlugin::new(Behavior::Reply("done"));
        let d = dispatcher(vec![("ok", "go", ok.clone() as Arc<dyn Plugin>)], sender.clone(), UnmatchedPolicy::Hint);
        let env = envelope("src:e1", "go");

        assert!(matches!(d.process(&env).await, Outcome::Failed(ProcessingError::Retryable(_))));

        sender.fail.store(false, Ordering::SeqCst);
        assert_eq!(d.process(&env).await, Outcome::Delivered);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_retryable() {
        let d = dispatcher(vec![], Arc::new(RecordingSender::default()), UnmatchedPolicy::Hint);
        assert!(matches!(
            d.process(&envelope("", "ping")).await,
            Outcome::Failed(ProcessingError::NonRetryable(_))
        ));
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let plugin = ScriptedPlugin::new(Behavior::Reply("x"));
        let sender = Arc::new(RecordingSender::default());
        let d = dispatcher(
            vec![("incident", r"incident\s+(\d+)", plugin.clone() as Arc<dyn Plugin>)],
            sender.clone(),
            UnmatchedPolicy::Hint,
        );

        let report = d.dry_run("<@UBOT> Incident 77", Scope::Channel);
        assert_eq!(report.plugin.as_deref(), Some("incident"));
        assert_eq!(report.captures.unwrap().get(1), Some("77"));
        assert!(d.dry_run("nothing here", Scope::Dm).plugin.is_none());

        assert_eq!(plugin.calls.load(Ordering::SeqCst), 0);
        assert!(sender.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_additional_responses_follow_primary_in_order() {
        let sender = Arc::new(RecordingSender::default());
        let d = dispatcher(
            vec![("escalate", "escalate", ScriptedPlugin::new(Behavior::Fanout) as Arc<dyn Plugin>)],
            sender.clone(),
            UnmatchedPolicy::Hint,
        );
        assert_eq!(d.process(&envelope("src:a1", "escalate")).await, Outcome::Delivered);

        let sent = sender.sent.lock().await;
        let posted: Vec<_> = sent.iter().map(|(dest, resp)| (dest.channel.as_str(), resp.text.as_str())).collect();
        assert_eq!(
            posted,
            [("C123", "escalated"), ("COPS", "incident escalated"), ("U42", "you are on call")]
        );
        assert_eq!(sent[0].0.thread.as_deref(), Some("1700000000.000100"));
        assert_eq!(sent[1].0.thread, None);
    }

    #[tokio::test]
    async fn test_failed_additional_response_does_not_fail_delivery() {
        let sender = Arc::new(RecordingSender::default());
        *sender.rejected_channel.lock().await = Some("COPS".to_string());
        let plugin = ScriptedPlugin::new(Behavior::Fanout);
        let d = dispatcher(
            vec![("escalate", "escalate", plugin.clone() as Arc<dyn Plugin>)],
            sender.clone(),
            UnmatchedPolicy::Hint,
        );

        assert_eq!(d.process(&envelope("src:a2", "escalate")).await, Outcome::Delivered);
        let sent = sender.sent.lock().await;
        let channels: Vec<_> = sent.iter().map(|(dest, _)| dest.channel.as_str()).collect();
        assert_eq!(channels, ["C123", "U42"]);
        assert_eq!(plugin.calls.load(Ordering::SeqCst), 1);
    }
}
