//! # Topology Installer
//!
//! Provisions the shared topic, this node's subscription and its routing
//! rule, then publishes the resulting connection to the holder.
//!
//! Every step is create-or-update, so concurrent installers on different
//! nodes converge. Steps run under the retry policy; races between nodes
//! surface as `EntityAlreadyExists`/`EntityNotFound` and are retried.

use crate::config::CompanionConfig;
use crate::connection::{BusConnection, BusConnectionHolder};
use crate::domain::{protocol, PEER_RULE_NAME};
use crate::error::CompanionError;
use crate::retry::RetryPolicy;
use shared_bus::{BusClient, BusConnector, BusError, MessageSender, RuleDescription, RuleFilter};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Installs and removes this node's bus topology.
pub struct TopologyInstaller {
    config: Arc<CompanionConfig>,
    connector: Arc<dyn BusConnector>,
    holder: Arc<BusConnectionHolder>,
    retry: RetryPolicy,
}

impl TopologyInstaller {
    /// Create an installer publishing into `holder`.
    pub fn new(
        config: Arc<CompanionConfig>,
        connector: Arc<dyn BusConnector>,
        holder: Arc<BusConnectionHolder>,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            config,
            connector,
            holder,
            retry,
        }
    }

    /// Routing filter of this node's subscription.
    pub fn desired_filter(&self) -> RuleFilter {
        protocol::routing_filter(&self.config.node_id)
    }

    /// Connect a fresh client, provision everything and publish the connection.
    pub async fn install(&self) -> Result<Arc<BusConnection>, CompanionError> {
        self.holder.mark_connecting();

        match self.provision().await {
            Ok((client, sender)) => self.holder.publish(client, sender).await,
            Err(err) => {
                self.holder.mark_disconnected();
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
    ) -> Result<(Arc<dyn BusClient>, Arc<dyn MessageSender>), CompanionError> {
        let connection_string = self.config.connection_string.as_str();
        let connector = &self.connector;
        let client = self
            .retry
            .run("connect", || async move {
                connector.connect(connection_string).await
            })
            .await?;

        match self.provision_with(&client).await {
            Ok(sender) => {
                info!(
                    node_id = %self.config.node_id,
                    topic = %self.config.topic_name,
                    "Bus topology installed"
                );
                Ok((client, sender))
            }
            Err(err) => {
                client.close().await;
                Err(err.into())
            }
        }
    }

    async fn provision_with(
        &self,
        client: &Arc<dyn BusClient>,
    ) -> Result<Arc<dyn MessageSender>, BusError> {
        self.ensure_topic(client).await?;
        self.ensure_subscription(client).await?;
        self.ensure_rules(client).await?;

        let topic = self.config.topic_name.as_str();
        self.retry
            .run("create_sender", || async move {
                client.create_sender(topic).await
            })
            .await
    }

    async fn ensure_topic(&self, client: &Arc<dyn BusClient>) -> Result<(), BusError> {
        let options = &self.config.topic_options();
        self.retry
            .run("ensure_topic", || async move {
                if client.topic_exists(&options.name).await? {
                    client.update_topic(options).await
                } else {
                    client.create_topic(options).await
                }
            })
            .await
    }

    async fn ensure_subscription(&self, client: &Arc<dyn BusClient>) -> Result<(), BusError> {
        let options = &self.config.subscription_options();
        self.retry
            .run("ensure_subscription", || async move {
                if client
                    .subscription_exists(&options.topic_name, &options.name)
                    .await?
                {
                    client.update_subscription(options).await
                } else {
                    client.create_subscription(options).await
                }
            })
            .await
    }

    /// Leave exactly one rule: the routing rule. Anything else, including the
    /// broker's catch-all default rule, is deleted.
    async fn ensure_rules(&self, client: &Arc<dyn BusClient>) -> Result<(), BusError> {
        let topic = self.config.topic_name.as_str();
        let subscription = self.config.node_id.as_str();
        let desired = &RuleDescription::new(PEER_RULE_NAME, self.desired_filter());

        self.retry
            .run("ensure_rules", || async move {
                let mut present = false;
                for rule in client.list_rules(topic, subscription).await? {
                    if rule == *desired {
                        present = true;
                        continue;
                    }
                    debug!(rule = %rule.name, filter = %rule.filter, "Deleting stale rule");
                    client.delete_rule(topic, subscription, &rule.name).await?;
                }
                if !present {
                    debug!(rule = %desired.name, filter = %desired.filter, "Creating routing rule");
                    client.create_rule(topic, subscription, desired).await?;
                }
                Ok(())
            })
            .await
    }

    /// Delete this node's subscription. Failures are logged.
    pub async fn uninstall(&self) {
        let topic = self.config.topic_name.as_str();
        let node_id = self.config.node_id.as_str();

        let (client, owned) = match self.holder.current() {
            Some(conn) => (Arc::clone(&conn.client), false),
            None => match self.connector.connect(&self.config.connection_string).await {
                Ok(client) => (client, true),
                Err(err) => {
                    warn!(node_id, error = %err, "Cannot connect to remove subscription");
                    return;
                }
            },
        };

        match client.delete_subscription(topic, node_id).await {
            Ok(()) => info!(node_id, topic, "Subscription removed"),
            Err(BusError::EntityNotFound(_)) => debug!(node_id, "Subscription already gone"),
            Err(err) => warn!(node_id, error = %err, "Failed to remove subscription"),
        }

        if owned {
            client.close().await;
        }
    }
}
