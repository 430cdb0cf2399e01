use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use conclave_bootstrap::{BootstrapAttempt, BootstrapServer};
use conclave_common::logging;
use conclave_config::Config;
use conclave_consensus::{ConsensusSink, EpochManager, EpochTransitionHooks};
use conclave_crypto::bls::BlsKeyPair;
use conclave_db::LedgerDb;
use conclave_netio::NetIoManager;
use conclave_p2p::{ConsensusP2p, MemP2p};
use conclave_persistence::BlockCache;
use conclave_primitives::prelude::*;
use conclave_rpc_api::ConclaveApiServer;
use conclave_rpc_types::ConfirmationNotification;
use conclave_state::block::{Block, DelegateEntry};
use conclave_tasks::{TaskExecutor, TaskManager};
use tokio::sync::broadcast;
use tracing::*;

use crate::args::Args;
use crate::helpers::*;
use crate::network::{ConsensusStack, GossipBridge, MeshSink, NodeStacks, StackRouter};

mod args;
mod helpers;
mod network;
mod rpc_server;

fn main() {
    let args: Args = argh::from_env();
    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = main_inner(args, config) {
        eprintln!("FATAL ERROR: {e}");
        std::process::exit(2);
    }
}

/// Everything a sealed-block pump needs, cloned per spawned task.
#[derive(Clone)]
struct NodeContext {
    executor: TaskExecutor,
    db: Arc<LedgerDb>,
    persistence: PersistenceHandles,
    verifier: Arc<CommitteeVerifier>,
    keypair: Arc<BlsKeyPair>,
    sink: Arc<dyn ConsensusSink>,
    stacks: Arc<NodeStacks>,
    gossip: Arc<ConsensusP2p>,
    confirm_tx: broadcast::Sender<Arc<ConfirmationNotification>>,
    epoch_manager: Arc<EpochManager>,
    delegate_id: DelegateId,
}

fn main_inner(_args: Args, config: Config) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.io_threads.max(2))
        .enable_all()
        .thread_name("conclave-rt")
        .build()
        .expect("init: build rt");
    let task_manager = TaskManager::new(runtime.handle().clone());
    let executor = task_manager.executor();

    let mut logger_config = logging::LoggerConfig::with_base_name("conclave-node");
    if let Some(url) = logging::get_otlp_url_from_env() {
        logger_config.set_otlp_url(url);
    }
    {
        // The OTLP exporter wants a runtime context at install time.
        let _g = runtime.handle().enter();
        logging::init(logger_config);
    }

    // The storage engine binding is external; the node runs on the
    // in-memory reference store.
    let db = Arc::new(LedgerDb::open());
    if conclave_persistence::genesis::needs_genesis(&db) {
        info!("store empty, seeding genesis");
        let mut faucet = Buf32::zero();
        faucet.0[31] = 0xfa;
        dev_genesis(&db, faucet)?;
    }

    let persistence = build_persistence(&db);
    let (sealed_epoch, committee) = current_committee(&db)?;
    let epoch_number = sealed_epoch + 1;

    let verifier = CommitteeVerifier::new(&committee);
    let cache = Arc::new(BlockCache::new(
        persistence.request.clone(),
        persistence.micro.clone(),
        persistence.epoch.clone(),
        verifier.clone(),
    ));

    // Delegate mesh.
    let stacks = Arc::new(NodeStacks::default());
    let router = Arc::new(StackRouter {
        stacks: stacks.clone(),
    });
    let addresses: HashMap<DelegateId, SocketAddr> = config
        .delegates
        .iter()
        .map(|d| (d.id, SocketAddr::new(d.ip, config.peer_port)))
        .collect();
    let netio = NetIoManager::new(
        config.delegate_id,
        epoch_number,
        addresses,
        router,
        config.heartbeat,
    );

    let keypair = Arc::new(dev_bls_keypair(config.delegate_id));
    let sink: Arc<dyn ConsensusSink> = Arc::new(MeshSink(netio.clone()));
    let stack = build_stack(
        &db,
        &persistence,
        config.delegate_id,
        epoch_number,
        committee,
        keypair.clone(),
        sink.clone(),
    );
    *stacks.current.write() = Some(stack.clone());

    // Gossip overlay; the production overlay is an external collaborator,
    // the in-memory stand-in keeps the receive path exercised.
    let overlay = Arc::new(MemP2p::default());
    let gossip = Arc::new(ConsensusP2p::new(
        overlay,
        Arc::new(GossipBridge {
            cache: cache.clone(),
            stacks: stacks.clone(),
        }),
    ));

    // Confirmation fan-out for the websocket façade.
    let (confirm_tx, _) = broadcast::channel::<Arc<ConfirmationNotification>>(1024);

    // Epoch transition choreography.
    let hooks = Arc::new(NodeTransitionHooks {
        netio: netio.clone(),
    });
    let epoch_manager = EpochManager::new(epoch_number, config.enable_epoch_transition, hooks);

    let context = NodeContext {
        executor: executor.clone(),
        db: db.clone(),
        persistence: persistence.clone(),
        verifier,
        keypair,
        sink,
        stacks: stacks.clone(),
        gossip,
        confirm_tx,
        epoch_manager,
        delegate_id: config.delegate_id,
    };
    spawn_stack_pumps(&context, &stack);

    // Periodic micro block proposals while this seat holds the micro
    // primary role.
    {
        let micro_persistence = persistence.micro.clone();
        let stacks = stacks.clone();
        let delegate_id = config.delegate_id;
        executor.spawn_critical_async("micro-proposer", async move {
            let mut ticker = tokio::time::interval(MICROBLOCK_PROPOSAL_TIME);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(stack) = stacks.current() else {
                    continue;
                };
                if delegate_id != epoch_primary(stack.epoch_number) {
                    continue;
                }
                match micro_persistence.build(delegate_id, false) {
                    Ok(mut mb) => {
                        mb.last_micro_block = mb.sequence() + 1 >= MICROBLOCKS_PER_EPOCH;
                        stack.micro.queue_proposal(mb);
                    }
                    Err(e) => error!(err = %e, "failed to build micro block"),
                }
            }
        });
    }

    // Bring the mesh up and release consensus from `Initializing`.
    {
        let netio = netio.clone();
        let peer_port = config.peer_port;
        let stack = stack.clone();
        executor.spawn_critical_async("delegate-mesh", async move {
            netio.start(peer_port).await?;
            // Connectivity settles, then rounds may start.
            tokio::time::sleep(Duration::from_secs(10)).await;
            stack.request.on_delegates_connected();
            stack.micro.on_delegates_connected();
            stack.epoch.on_delegates_connected();
            Ok(())
        });
    }

    // Bootstrap: serve peers, and catch up if we're behind.
    let bootstrap_server = BootstrapServer::new(db.clone());
    {
        let server = bootstrap_server.clone();
        let bin_port = config.bin_port;
        executor.spawn_critical_async("bootstrap-server", async move {
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", bin_port)).await?;
            server.serve(listener).await;
            Ok(())
        });
    }
    let bootstrap_peers: Vec<SocketAddr> = config
        .all_delegates
        .iter()
        .filter(|d| d.id != config.delegate_id)
        .map(|d| SocketAddr::new(d.ip, config.bin_port))
        .collect();
    if !bootstrap_peers.is_empty() {
        let pool_size = config
            .bootstrap_connections
            .clamp(1, config.bootstrap_connections_max.max(1));
        let attempt =
            BootstrapAttempt::new(bootstrap_peers, pool_size, cache.clone(), bootstrap_server);
        executor.spawn_critical_async("bootstrap", async move {
            match attempt.run().await {
                Ok(()) => Ok(()),
                Err(conclave_bootstrap::BootstrapError::NoPeers) => {
                    warn!("no bootstrap peers reachable, continuing from local state");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        });
    }

    // JSON-RPC façade.
    if config.rpc_enable {
        let rpc_impl = rpc_server::ConclaveRpcImpl::new(db.clone(), stacks.clone());
        let rpc_addr = format!("{}:{}", config.rpc.host, config.json_port);
        executor.spawn_critical_async("json-rpc", async move {
            let server = jsonrpsee::server::ServerBuilder::new()
                .build(rpc_addr.clone())
                .await?;
            info!(%rpc_addr, "JSON-RPC listening");
            let handle = server.start(rpc_impl.into_rpc());
            handle.stopped().await;
            Ok(())
        });
    }

    info!(
        delegate = config.delegate_id,
        epoch = epoch_number,
        "node initialized"
    );

    task_manager.start_signal_listeners();
    let result = task_manager.monitor(Some(Duration::from_secs(5)));
    logging::finalize();
    result
}

/// Subscribes the gossip/confirmation/epoch pumps to one stack's sealed
/// blocks.  Called again for every incoming stack, so sealed blocks keep
/// flowing across epoch rotations.
fn spawn_stack_pumps(context: &NodeContext, stack: &Arc<ConsensusStack>) {
    for kind in [
        ConsensusKind::Request,
        ConsensusKind::MicroBlock,
        ConsensusKind::Epoch,
    ] {
        let mut sealed_rx = match kind {
            ConsensusKind::Request => stack.request.subscribe_sealed(),
            ConsensusKind::MicroBlock => stack.micro.subscribe_sealed(),
            ConsensusKind::Epoch => stack.epoch.subscribe_sealed(),
        };
        let context = context.clone();
        let stack = stack.clone();
        context
            .executor
            .clone()
            .spawn_critical_async("sealed-pump", async move {
                loop {
                    let block = match sealed_rx.recv().await {
                        Ok(block) => block,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "sealed pump lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };

                    context.gossip.propagate_block(&block);
                    let _ = context.confirm_tx.send(Arc::new(
                        ConfirmationNotification::new(block.as_ref().clone()),
                    ));

                    match block.as_ref() {
                        Block::Micro(mb) if mb.last_micro_block => {
                            let elected = next_committee(&context.db);
                            context
                                .epoch_manager
                                .on_last_micro_block(mb.epoch_number(), elected);

                            // The epoch primary closes the epoch.
                            if context.delegate_id == epoch_primary(mb.epoch_number()) {
                                match context.persistence.epoch.build(context.delegate_id) {
                                    Ok(eb) => stack.epoch.queue_proposal(eb),
                                    Err(e) => {
                                        error!(err = %e, "failed to build epoch block")
                                    }
                                }
                            }
                        }
                        Block::Epoch(eb) => {
                            on_epoch_sealed(&context, &stack, eb);
                        }
                        _ => {}
                    }
                }
                Ok(())
            });
    }
}

/// Committee rotation: trust the new keys, stand the incoming stack up
/// beside the retiring one, forward any handed-over queue, then promote.
fn on_epoch_sealed(
    context: &NodeContext,
    retiring: &Arc<ConsensusStack>,
    eb: &conclave_state::block::EpochBlock,
) {
    context.verifier.rotate(&eb.delegates);

    let next_stack = build_stack(
        &context.db,
        &context.persistence,
        context.delegate_id,
        eb.epoch_number() + 1,
        eb.delegates,
        context.keypair.clone(),
        context.sink.clone(),
    );
    spawn_stack_pumps(context, &next_stack);
    next_stack.request.on_delegates_connected();
    next_stack.micro.on_delegates_connected();
    next_stack.epoch.on_delegates_connected();

    context
        .epoch_manager
        .forward_request_queue(&retiring.request, &next_stack.request);

    *context.stacks.next.write() = Some(next_stack);
    context.epoch_manager.on_epoch_block_applied(eb.epoch_number());
    context.stacks.promote_next();
}

/// The seat driving micro and epoch rounds for an epoch.
fn epoch_primary(epoch: u32) -> DelegateId {
    (epoch % NUM_DELEGATES as u32) as DelegateId
}

/// The committee the election would seal right now.
fn next_committee(db: &Arc<LedgerDb>) -> [DelegateEntry; NUM_DELEGATES] {
    let mut txn = db.begin();
    let incumbents = txn
        .eb_tip_get()
        .ok()
        .flatten()
        .and_then(|hash| txn.epoch_block_get(&hash).ok().flatten())
        .map(|eb| eb.delegates)
        .unwrap_or([DelegateEntry::default(); NUM_DELEGATES]);
    conclave_persistence::elections::election_results(&mut txn, &incumbents).unwrap_or(incumbents)
}

/// Stack choreography at epoch boundaries.  This node shares one mesh
/// transport across epochs, so retirement only logs; a deployment with
/// per-epoch channel sets would mark the old set `epoch_over` here.
struct NodeTransitionHooks {
    netio: Arc<NetIoManager>,
}

impl EpochTransitionHooks for NodeTransitionHooks {
    fn build_next_stack(
        &self,
        next_epoch: u32,
        _committee: [DelegateEntry; NUM_DELEGATES],
    ) -> anyhow::Result<()> {
        // The incoming stack is assembled on the sealed-epoch-block path,
        // once the committee is durable.
        info!(next_epoch, "preparing incoming consensus stack");
        Ok(())
    }

    fn retire_stack(&self, epoch: u32) {
        info!(
            epoch,
            connected = self.netio.connected_count(),
            "retired consensus stack drained"
        );
    }
}
