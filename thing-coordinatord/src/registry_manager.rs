use std::collections::HashMap;
use std::net::IpAddr;
use std::thread;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::registry::{CapabilityModel, MergeOutcome};
use shared::tweet::Tweet;
use shared::types::{Entity, Relationship, Service, Thing};
use crate::config::RegistryConfig;
use crate::registry::hash;
use crate::registry::staleness::StalenessPolicy;
pub use crate::discovery::listener::DiscoveryEvent;

/// Commands sent to the registry thread
pub enum RegistryCommand {
    Apply {
        tweet: Tweet,
        source: IpAddr,
        reply: oneshot::Sender<MergeOutcome>,
    },
    Things(oneshot::Sender<Vec<Thing>>),
    Entities(oneshot::Sender<Vec<Entity>>),
    Services(oneshot::Sender<Vec<Service>>),
    Relationships(oneshot::Sender<Vec<Relationship>>),
    Stale(oneshot::Sender<Vec<String>>),
    Shutdown,
}

/// Everything the registry thread owns
struct RegistryState {
    model: CapabilityModel,
    /// Last announcement per Thing, kept beside the records so they are never rewritten
    last_heard: HashMap<String, DateTime<Utc>>,
    policy: Box<dyn StalenessPolicy>,
}

impl RegistryState {
    fn apply(&mut self, tweet: &Tweet, source: IpAddr) -> MergeOutcome {
        let now = Utc::now();
        let outcome = self.model.apply(tweet, source, now);
        if let Some(thing_id) = tweet.thing_id() {
            if self.model.thing(thing_id).is_some() {
                self.last_heard.insert(thing_id.to_string(), now);
            }
        }
        outcome
    }

    fn stale_things(&self) -> Vec<String> {
        let now = Utc::now();
        self.model
            .things()
            .iter()
            .filter(|t| {
                let heard = self.last_heard.get(&t.id).copied().unwrap_or(t.discovered_at);
                self.policy.is_stale(heard, now)
            })
            .map(|t| t.id.clone())
            .collect()
    }

    fn fingerprint(&self) -> String {
        hash::compute_hash(self.model.things(), self.model.relationships())
    }
}

/// Handle to the process-wide capability registry.
///
/// One thread owns the model and is its only writer; readers get owned
/// snapshots, so they never observe a half-applied merge.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn the registry thread around an initial model
    pub fn spawn(
        model: CapabilityModel,
        policy: Box<dyn StalenessPolicy>,
        hash_tx: watch::Sender<String>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryCommand>(256);

        let mut state = RegistryState {
            model,
            last_heard: HashMap::new(),
            policy,
        };

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    RegistryCommand::Apply { tweet, source, reply } => {
                        let outcome = state.apply(&tweet, source);
                        // only recompute the fingerprint when the model grew
                        if outcome.changed() {
                            let _ = hash_tx.send(state.fingerprint());
                        }
                        let _ = reply.send(outcome);
                    }
                    RegistryCommand::Things(reply) => {
                        let _ = reply.send(state.model.things().to_vec());
                    }
                    RegistryCommand::Entities(reply) => {
                        let _ = reply.send(state.model.entities().cloned().collect());
                    }
                    RegistryCommand::Services(reply) => {
                        let _ = reply.send(state.model.services().cloned().collect());
                    }
                    RegistryCommand::Relationships(reply) => {
                        let _ = reply.send(state.model.relationships().to_vec());
                    }
                    RegistryCommand::Stale(reply) => {
                        let _ = reply.send(state.stale_things());
                    }
                    RegistryCommand::Shutdown => {
                        tracing::info!("Registry thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Merge one announcement into the registry
    pub async fn apply(&self, tweet: Tweet, source: IpAddr) -> Result<MergeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Apply { tweet, source, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn things(&self) -> Result<Vec<Thing>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Things(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn entities(&self) -> Result<Vec<Entity>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Entities(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn services(&self) -> Result<Vec<Service>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Services(reply)).await?;
        Ok(rx.await?)
    }

    pub async fn relationships(&self) -> Result<Vec<Relationship>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Relationships(reply)).await?;
        Ok(rx.await?)
    }

    /// Ids of Things the staleness policy currently reports
    pub async fn stale_things(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryCommand::Stale(reply)).await?;
        Ok(rx.await?)
    }

    /// Shutdown the registry thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(RegistryCommand::Shutdown).await?;
        Ok(())
    }
}

/// Registry manager event loop - bridges discovery events to the registry
pub async fn run(
    registry: RegistryHandle,
    mut rx: mpsc::Receiver<DiscoveryEvent>,
    config: RegistryConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut maintenance_interval = tokio::time::interval(
        std::time::Duration::from_secs(config.maintenance_interval_secs.max(1))
    );

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                match event {
                    DiscoveryEvent::Announced { tweet, source } => {
                        let kind = tweet.kind().to_string();
                        match registry.apply(tweet, source).await {
                            Ok(MergeOutcome::Added) => {
                                tracing::info!("Registered {} from {}", kind, source);
                            }
                            Ok(MergeOutcome::Duplicate) => {
                                tracing::trace!("Duplicate {} from {}", kind, source);
                            }
                            Ok(outcome) => {
                                tracing::debug!("Dropped {} from {}: {:?}", kind, source, outcome);
                            }
                            Err(e) => {
                                tracing::error!("Failed to apply announcement: {}", e);
                            }
                        }
                    }
                }
            }
            _ = maintenance_interval.tick() => {
                match registry.stale_things().await {
                    Ok(stale) if !stale.is_empty() => {
                        tracing::info!("{} thing(s) have gone quiet: {}", stale.len(), stale.join(", "));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Failed to run registry maintenance: {}", e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Registry manager shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::tweet::{EntityTweet, ServiceTweet, ThingTweet};
    use crate::registry::staleness::{NeverStale, SilentFor};

    fn thing_tweet() -> Tweet {
        Tweet::IdentityThing(ThingTweet {
            thing_id: "MySmartThing01".into(),
            space_id: "MySmartSpace".into(),
            name: "RaspberryPi".into(),
            model: "4B".into(),
            owner: "IoTLab".into(),
            vendor: "RaspberryPiCo".into(),
            description: String::new(),
        })
    }

    fn entity_tweet() -> Tweet {
        Tweet::IdentityEntity(EntityTweet {
            thing_id: "MySmartThing01".into(),
            space_id: "MySmartSpace".into(),
            name: "FlameAlarm".into(),
            entity_id: "FlameAlarm01".into(),
            kind: "Connected".into(),
            owner: String::new(),
            vendor: String::new(),
            description: String::new(),
        })
    }

    fn service_tweet() -> Tweet {
        Tweet::Service(ServiceTweet {
            thing_id: "MySmartThing01".into(),
            entity_id: "FlameAlarm01".into(),
            space_id: "MySmartSpace".into(),
            name: "CheckFlameStatus".into(),
            api: "CheckFlameStatus:[NULL]:(flameStatus,int, NULL)".into(),
            kind: "Report".into(),
            app_category: "Safety".into(),
            description: "flame sensor".into(),
            keywords: "flame,sensor".into(),
        })
    }

    fn source() -> IpAddr {
        "192.168.8.201".parse().unwrap()
    }

    #[tokio::test]
    async fn test_apply_and_read_back() {
        let (hash_tx, hash_rx) = watch::channel(String::new());
        let registry = RegistryHandle::spawn(CapabilityModel::new(), Box::new(NeverStale), hash_tx);

        for tweet in [thing_tweet(), entity_tweet(), service_tweet()] {
            assert_eq!(registry.apply(tweet, source()).await.unwrap(), MergeOutcome::Added);
        }
        let fingerprint = hash_rx.borrow().clone();
        assert!(!fingerprint.is_empty());

        // replaying the same announcements changes nothing, not even the fingerprint
        for tweet in [thing_tweet(), entity_tweet(), service_tweet()] {
            assert_eq!(registry.apply(tweet, source()).await.unwrap(), MergeOutcome::Duplicate);
        }
        assert_eq!(*hash_rx.borrow(), fingerprint);

        assert_eq!(registry.things().await.unwrap().len(), 1);
        assert_eq!(registry.entities().await.unwrap().len(), 1);
        let services = registry.services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].address, Some(source()));
        assert!(registry.relationships().await.unwrap().is_empty());

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_things_reported_by_policy() {
        let (hash_tx, _hash_rx) = watch::channel(String::new());
        let registry = RegistryHandle::spawn(
            CapabilityModel::new(),
            Box::new(SilentFor(std::time::Duration::ZERO)),
            hash_tx,
        );

        registry.apply(thing_tweet(), source()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(registry.stale_things().await.unwrap(), vec!["MySmartThing01".to_string()]);
        // reporting never removes anything
        assert_eq!(registry.things().await.unwrap().len(), 1);
    }
}
