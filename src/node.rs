//! Async node runtime
//!
//! [`RabiaNode`] owns one [`RabiaEngine`] inside a tokio task and wires it
//! to the topology, leader tracking and the transport:
//!
//! ```text
//!  propose/status ──▶ command channel ─┐
//!  transport inbox ────────────────────┤
//!  router: quorum, membership ─────────┼──▶ actor loop ──▶ RabiaEngine
//!  tick interval ──────────────────────┤
//!  reconciliation interval ────────────┘──▶ TopologyManager::reconcile
//! ```
//!
//! All engine state is touched from the actor task only. Handles talk to it
//! through channels, so the engine itself needs no locking.

use crate::config::{Config, ConfigError};
use crate::engine::{EngineStatus, RabiaEngine, Responder};
use crate::error::{RabiaError, Result};
use crate::leader::LeaderManager;
use crate::messages::{ClusterEvent, EventKind, ProtocolMessage};
use crate::metrics::EngineMetrics;
use crate::router::MessageRouter;
use crate::state_machine::StateMachine;
use crate::storage::PersistenceStore;
use crate::topology::{ConnectionControl, TopologyManager};
use crate::transport::{ClusterNetwork, MemoryHub};
use crate::types::{NodeId, NodeInfo};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

enum NodeCommand<S: StateMachine> {
    Propose {
        commands: Vec<S::Command>,
        responder: Responder<S::Response>,
    },
    Status {
        responder: oneshot::Sender<EngineStatus>,
    },
    Shutdown {
        done: oneshot::Sender<Result<()>>,
    },
}

#[derive(Debug)]
enum NodeEvent {
    Quorum(bool),
    Membership(Vec<NodeId>),
}

type StopHook = Box<dyn FnOnce() + Send>;

/// Handle to a running consensus node
pub struct RabiaNode<S: StateMachine> {
    node_id: NodeId,
    commands: mpsc::Sender<NodeCommand<S>>,
    router: Arc<MessageRouter<ClusterEvent>>,
    topology: Arc<TopologyManager>,
    leader: Arc<LeaderManager>,
    metrics: Arc<EngineMetrics>,
    task: Mutex<Option<JoinHandle<()>>>,
    on_stop: Mutex<Option<StopHook>>,
}

impl<S: StateMachine> RabiaNode<S> {
    /// Start a node attached to an in-process hub
    ///
    /// Must be called from within a tokio runtime. The node leaves the hub
    /// on [`RabiaNode::shutdown`].
    pub fn start_in_memory<P>(
        config: &Config,
        state_machine: S,
        store: P,
        hub: &Arc<MemoryHub<S::Command>>,
    ) -> Result<Self>
    where
        P: PersistenceStore<S::Command> + 'static,
    {
        let node_id = required_id(config)?;
        let router = Arc::new(MessageRouter::new());
        let (network, inbound) = hub.join(node_id, &router);
        let node = Self::start(config, state_machine, store, router, network, inbound)?;
        let hub = hub.clone();
        *node.on_stop.lock() = Some(Box::new(move || hub.leave(node_id)));
        Ok(node)
    }

    /// Start a node over any transport
    ///
    /// `router` must be the router the transport reports connectivity to,
    /// and `inbound` the stream of messages addressed to this node. Must be
    /// called from within a tokio runtime.
    pub fn start<N, P>(
        config: &Config,
        state_machine: S,
        store: P,
        router: Arc<MessageRouter<ClusterEvent>>,
        network: N,
        inbound: mpsc::UnboundedReceiver<ProtocolMessage<S::Command>>,
    ) -> Result<Self>
    where
        N: ClusterNetwork<S::Command> + ConnectionControl + Clone + 'static,
        P: PersistenceStore<S::Command> + 'static,
    {
        config.validate()?;
        let node_id = required_id(config)?;
        let self_info = config
            .node
            .members
            .iter()
            .find(|member| member.id == node_id)
            .cloned()
            .unwrap_or_else(|| NodeInfo::new(node_id, "local"));

        let topology = Arc::new(TopologyManager::new(
            self_info,
            config.topology.backoff.clone(),
            Arc::new(network.clone()),
            router.clone(),
        ));
        topology.attach();
        for member in &config.node.members {
            topology.add_node(member.clone());
        }
        let leader = LeaderManager::attach(topology.clone(), router.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        register_node_routes(&router, &topology, events_tx.clone());
        router
            .validate()
            .map_err(|missing| RabiaError::InvariantViolation {
                component: "router".to_string(),
                details: missing.to_string(),
            })?;

        let mut members = config.member_ids();
        members.push(node_id);
        let engine = RabiaEngine::new(
            node_id,
            members,
            config.protocol.clone(),
            state_machine,
            network,
            store,
            Instant::now().into_std(),
        )?;
        let metrics = engine.metrics();

        topology.reconcile(Instant::now().into_std());
        if topology.has_quorum() {
            let _ = events_tx.send(NodeEvent::Quorum(true));
        }
        leader.refresh();

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = NodeActor {
            engine,
            topology: topology.clone(),
            commands: commands_rx,
            events: events_rx,
            inbound,
            tick_interval: config.protocol.tick_interval(),
            reconciliation_interval: config.topology.reconciliation_interval,
        };
        let task = tokio::spawn(actor.run());

        info!(node = %node_id, members = topology.cluster_size(), "node started");
        Ok(Self {
            node_id,
            commands: commands_tx,
            router,
            topology,
            leader,
            metrics,
            task: Mutex::new(Some(task)),
            on_stop: Mutex::new(None),
        })
    }

    /// Local node id
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Replicate commands and wait for their responses
    ///
    /// Resolves once the batch is applied locally. While quorum is lost the
    /// future stays pending; wrap it in a timeout to bound the wait.
    pub async fn propose(&self, commands: Vec<S::Command>) -> Result<Vec<S::Response>> {
        let (responder, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Propose {
                commands,
                responder,
            })
            .await
            .map_err(|_| RabiaError::node_stopped("propose"))?;
        rx.await.map_err(|_| RabiaError::node_stopped("propose"))?
    }

    /// Point-in-time engine status
    pub async fn status(&self) -> Result<EngineStatus> {
        let (responder, rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Status { responder })
            .await
            .map_err(|_| RabiaError::node_stopped("status"))?;
        rx.await.map_err(|_| RabiaError::node_stopped("status"))
    }

    /// Current leader, `None` without quorum
    pub fn leader(&self) -> Option<NodeId> {
        self.leader.leader()
    }

    /// Whether this node is the current leader
    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    /// Add a member; the engine adopts it at the next phase boundary
    pub fn add_member(&self, info: NodeInfo) {
        self.router.route(&ClusterEvent::AddNode(info));
    }

    /// Remove a member; the engine drops it at the next phase boundary
    pub fn remove_member(&self, id: NodeId) {
        self.router.route(&ClusterEvent::RemoveNode(id));
    }

    /// Membership and health view
    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    /// Shared engine counters
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Stop the actor after writing a final checkpoint
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        let flushed = match self.commands.send(NodeCommand::Shutdown { done }).await {
            Ok(()) => rx.await.unwrap_or(Ok(())),
            Err(_) => Ok(()),
        };
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(node = %self.node_id, error = %e, "node task failed");
            }
        }
        if let Some(hook) = self.on_stop.lock().take() {
            hook();
        }
        info!(node = %self.node_id, "node stopped");
        flushed
    }
}

fn required_id(config: &Config) -> Result<NodeId> {
    config.node.id.ok_or_else(|| {
        ConfigError::Missing {
            field: "node.id".to_string(),
        }
        .into()
    })
}

fn register_node_routes(
    router: &MessageRouter<ClusterEvent>,
    topology: &Arc<TopologyManager>,
    events: mpsc::UnboundedSender<NodeEvent>,
) {
    let quorum_events = events.clone();
    router.add_routes(
        &[EventKind::QuorumEstablished, EventKind::QuorumDisappeared],
        move |event| {
            let present = matches!(event, ClusterEvent::QuorumEstablished);
            let _ = quorum_events.send(NodeEvent::Quorum(present));
        },
    );

    let weak: Weak<TopologyManager> = Arc::downgrade(topology);
    router.add_routes(&[EventKind::NodeAdded, EventKind::NodeRemoved], move |_| {
        if let Some(topology) = weak.upgrade() {
            let _ = events.send(NodeEvent::Membership(topology.topology()));
        }
    });

    router.add_route(EventKind::LeaderChanged, |event| {
        if let ClusterEvent::LeaderChanged { leader, is_local } = event {
            debug!(leader = ?leader, is_local, "leadership observed by node");
        }
    });
}

struct NodeActor<S: StateMachine, N, P> {
    engine: RabiaEngine<S, N, P>,
    topology: Arc<TopologyManager>,
    commands: mpsc::Receiver<NodeCommand<S>>,
    events: mpsc::UnboundedReceiver<NodeEvent>,
    inbound: mpsc::UnboundedReceiver<ProtocolMessage<S::Command>>,
    tick_interval: Duration,
    reconciliation_interval: Duration,
}

impl<S, N, P> NodeActor<S, N, P>
where
    S: StateMachine,
    N: ClusterNetwork<S::Command> + 'static,
    P: PersistenceStore<S::Command> + 'static,
{
    async fn run(mut self) {
        let node_id = self.engine.node_id();
        let mut tick = interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reconcile = interval(self.reconciliation_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(node = %node_id, "node actor running");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(NodeCommand::Shutdown { done }) => {
                        let _ = done.send(self.engine.flush());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        if let Err(e) = self.engine.flush() {
                            warn!(node = %node_id, error = %e, "final checkpoint failed");
                        }
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(message) = self.inbound.recv() => self.engine.handle_message(message),
                _ = tick.tick() => self.engine.on_tick(Instant::now().into_std()),
                _ = reconcile.tick() => self.topology.reconcile(Instant::now().into_std()),
            }
        }
        debug!(node = %node_id, "node actor exited");
    }

    fn handle_command(&mut self, command: NodeCommand<S>) {
        match command {
            NodeCommand::Propose {
                commands,
                responder,
            } => {
                // Rejections are delivered through the responder
                if let Err(e) = self.engine.submit(commands, Some(responder)) {
                    debug!(node = %self.engine.node_id(), error = %e, "proposal rejected");
                }
            }
            NodeCommand::Status { responder } => {
                let _ = responder.send(self.engine.status());
            }
            NodeCommand::Shutdown { .. } => {}
        }
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Quorum(true) => self.engine.on_quorum_established(),
            NodeEvent::Quorum(false) => self.engine.on_quorum_lost(),
            NodeEvent::Membership(members) => self.engine.update_membership(members),
        }
    }
}
