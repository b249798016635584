use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use structopt::StructOpt;
use tokio::sync::mpsc;

use unison_core::catchup::CatchUp;
use unison_core::clock::{RoomClock, SampleOutcome};
use unison_core::discovery::{DiscoveredRoom, Discovery, NoDiscovery};
use unison_core::keepsync::{Action, ClientSnapshot, KeepSync, KeepSyncConfig, NoopReason};
use unison_core::metrics::{restrict_action, ActionKind, ProtectionEvent, SyncMetrics, SyncSample};
use unison_core::schedule::{RoomTime, StartOutcome, StartScheduler};
use unison_protocol::message::{Message, TrackAnnounce};
use unison_protocol::time::{RoomMs, WallMs};
use unison_protocol::types::{
    DeviceInfo, Epoch, HostState, PeerId, Role, RoomId, Seq, SessionId, StartDescriptor, TrackId,
};

use crate::config::{self, Profile};
use crate::player::{self, NullPlayer, SharedPlayer};
use crate::socket::{PeerAddr, ProtocolSocket, Socket, SocketOpt};
use crate::stats;
use crate::time;
use crate::track::{self, TrackCache, TrackError};
use crate::RunError;

pub mod clock_task;

use self::clock_task::ClockTask;

const HOST_STATE_INTERVAL_MS: u64 = 200;
const HOST_STATE_RING: usize = 16;

/// After issuing a seek, host states are ignored until the decoder
/// reports a position near the target, bounded by this window.
const SEEK_ECHO_WINDOW_MS: i64 = 800;
const SEEK_ECHO_TOLERANCE_MS: i64 = 300;

#[derive(StructOpt, Clone)]
pub struct HostOpt {
    #[structopt(flatten)]
    pub socket: SocketOpt,

    /// Room name
    #[structopt(long, env = "UNISON_ROOM", default_value = "unison")]
    pub room: String,

    /// Audio file to play
    #[structopt(long)]
    pub track: PathBuf,

    /// How far in the future to schedule the coordinated start
    #[structopt(long, default_value = "1500")]
    pub lead_ms: i64,

    /// Track position to start from
    #[structopt(long, default_value = "0")]
    pub start_pos_ms: i64,
}

#[derive(StructOpt, Clone)]
pub struct JoinOpt {
    #[structopt(flatten)]
    pub socket: SocketOpt,

    /// Room name
    #[structopt(long, env = "UNISON_ROOM", default_value = "unison")]
    pub room: String,

    /// Directory the track distributor delivers files into
    #[structopt(long, env = "UNISON_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Manual output calibration, -300..300 ms
    #[structopt(
        long,
        env = "UNISON_CALIBRATION_OFFSET_MS",
        default_value = "0",
        allow_hyphen_values = true
    )]
    pub calibration_offset_ms: i64,

    /// Measured output-path latency, 0..500 ms
    #[structopt(long, env = "UNISON_LATENCY_COMP_MS", default_value = "0")]
    pub latency_comp_ms: i64,

    /// Controller profile: default or ios_safe
    #[structopt(long, env = "UNISON_SYNC_PROFILE", default_value = "default")]
    pub profile: Profile,
}

/// Completions delivered back to the facade loop as messages.
enum Event {
    Started {
        epoch: Epoch,
        seq: Seq,
        outcome: StartOutcome,
    },
    CatchUpFinished {
        ok: bool,
    },
    TrackVerified {
        track_id: TrackId,
        started_at: Instant,
        result: Result<PathBuf, TrackError>,
    },
}

/// Room time handle shared with waiting tasks.
#[derive(Clone)]
struct ClockHandle(Arc<Mutex<RoomClock>>);

impl ClockHandle {
    fn room_now(&self) -> RoomMs {
        self.0.lock().unwrap().room_now(time::wall_now())
    }
}

impl RoomTime for ClockHandle {
    fn room_now(&self) -> RoomMs {
        ClockHandle::room_now(self)
    }
}

fn generate_peer_id() -> PeerId {
    PeerId(format!("{:08x}", rand::random::<u32>()))
}

fn device_info() -> DeviceInfo {
    DeviceInfo {
        model: None,
        os: Some(std::env::consts::OS.to_string()),
        app_version: Some(env!("CARGO_PKG_VERSION").to_string()),
    }
}

/// Host states must move strictly forward within an epoch; older
/// epochs are dropped outright.
fn accepts_host_state(last: Option<(Epoch, Seq)>, epoch: Epoch, seq: Seq) -> bool {
    match last {
        None => true,
        Some((last_epoch, last_seq)) => {
            epoch > last_epoch || (epoch == last_epoch && seq > last_seq)
        }
    }
}

struct SeekEcho {
    issued_at: WallMs,
    target_ms: i64,
}

impl SeekEcho {
    fn new(issued_at: WallMs, target_ms: i64) -> Self {
        SeekEcho { issued_at, target_ms }
    }

    fn suppresses(&self, now: WallMs, pos_ms: i64) -> bool {
        now.millis_since(self.issued_at) < SEEK_ECHO_WINDOW_MS
            && (pos_ms - self.target_ms).abs() > SEEK_ECHO_TOLERANCE_MS
    }
}

// ---------------------------------------------------------------------------
// host
// ---------------------------------------------------------------------------

pub async fn run_host(opt: HostOpt) -> Result<(), RunError> {
    let stats = stats::get();
    let socket = ProtocolSocket::new(Socket::open(opt.socket)?);
    let player: SharedPlayer = player::shared(NullPlayer::new());
    let clock = Arc::new(Mutex::new(RoomClock::host()));
    let clock_handle = ClockHandle(clock.clone());

    let room_id = RoomId(opt.room.clone());
    let peer_id = generate_peer_id();
    let session_id = SessionId(time::wall_now().0);

    // fingerprint and probe the track before anything goes on the wire
    let (file_hash, size_bytes) = track::announce_local_file(&opt.track).await?;
    let duration_ms = player.lock().unwrap().load(&opt.track)?;
    let track_id = TrackId(format!("t-{}", &file_hash[..12]));

    let file_name = opt
        .track
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    let announce = TrackAnnounce {
        room_id: room_id.clone(),
        host_peer_id: peer_id.clone(),
        track_id: track_id.clone(),
        url: format!("file://{}", opt.track.display()),
        file_hash,
        size_bytes,
        duration_ms,
        file_name,
    };

    log::info!(
        "hosting room {room_id}: track {track_id} ({duration_ms}ms, {size_bytes} bytes)"
    );

    let mut discovery = NoDiscovery;
    if let Err(e) = discovery.publish(&DiscoveredRoom {
        room_id: room_id.clone(),
        room_name: opt.room.clone(),
        host_ip: std::net::Ipv4Addr::UNSPECIFIED.into(),
        ws_port: 0,
        http_port: 0,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        codec: None,
    }) {
        log::warn!("publishing room: {e}");
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let scheduler = StartScheduler::new();

    // open the playback session and schedule the coordinated start
    let (epoch, descriptor) = {
        let mut clock = clock.lock().unwrap();
        let epoch = clock.new_epoch();
        let seq = clock.next_seq();
        let start_at = clock.room_now(time::wall_now()).add_ms(opt.lead_ms);
        let descriptor = StartDescriptor {
            epoch,
            seq,
            track_id: track_id.clone(),
            start_at_room_time_ms: start_at,
            start_pos_ms: opt.start_pos_ms,
        };
        (epoch, descriptor)
    };

    socket.broadcast(&Message::TrackAnnounce(announce.clone())).await
        .map_err(RunError::Transport)?;
    socket.broadcast(&Message::StartAt(descriptor.clone())).await
        .map_err(RunError::Transport)?;

    schedule_start(&scheduler, clock_handle.clone(), descriptor, player.clone(), &event_tx);

    let mut peers: HashMap<PeerAddr, PeerId> = HashMap::new();
    let mut started = false;
    let mut was_playing = false;

    let mut state_timer =
        tokio::time::interval(std::time::Duration::from_millis(HOST_STATE_INTERVAL_MS));
    state_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = socket.recv_from(time::wall_now) => {
                let (message, peer) = result.map_err(RunError::Transport)?;

                match message {
                    Message::Hello { proto_ver, room_id: hello_room, peer_id: hello_peer, role, .. } => {
                        if hello_room != room_id || role == Role::Host {
                            continue;
                        }
                        if proto_ver != unison_protocol::PROTO_VERSION {
                            log::warn!("peer {hello_peer} speaks protocol {proto_ver}, expected {}",
                                unison_protocol::PROTO_VERSION);
                        }

                        log::info!("peer joined: {hello_peer} from {peer}");
                        peers.insert(peer, hello_peer.clone());

                        let now = clock_handle.room_now();
                        let _ = socket.send_to(&Message::Welcome {
                            session_id,
                            server_now_ms: now,
                        }, peer).await;

                        // the rest of the room learns about the join;
                        // the joiner alone gets the current track
                        let _ = socket.broadcast(&Message::PeerJoin {
                            peer_id: hello_peer,
                            role: Some(Role::Client),
                            device_info: None,
                        }).await;
                        let _ = socket.send_to(&Message::TrackAnnounce(announce.clone()), peer).await;
                    }
                    Message::Ping { seq, t0_client_ms } => {
                        let t1 = clock_handle.room_now();
                        let _ = socket.send_to(&Message::Pong {
                            seq,
                            t0_client_ms,
                            t1_server_ms: t1,
                        }, peer).await;
                    }
                    Message::ClientReady { track_id: ready_track, prepare_ms, .. } => {
                        log::info!("peer {peer} ready: track={ready_track} prepare={prepare_ms}ms");
                    }
                    Message::ClientReadyError { track_id: ready_track, error_code, error_message } => {
                        log::warn!(
                            "peer {peer} failed to prepare {ready_track}: {error_code:?}: {error_message}"
                        );
                    }
                    Message::ClientStartReport { peer_id: reporter, start_error_ms, .. } => {
                        log::info!("peer {reporter} started with error {start_error_ms}ms");
                    }
                    Message::PeerLeave { peer_id: leaver, reason } => {
                        log::info!("peer left: {leaver} ({})", reason.as_deref().unwrap_or("no reason"));
                        peers.retain(|_, id| *id != leaver);
                    }
                    _ => {
                        // host_state, start_at etc. only flow host -> client
                    }
                }
            }

            _ = state_timer.tick(), if started => {
                let (pos_ms, is_playing) = {
                    let mut player = player.lock().unwrap();
                    (player.position().unwrap_or(0), player.is_playing())
                };

                // broadcast pauses once, then go quiet until resume
                if !is_playing && !was_playing {
                    continue;
                }
                was_playing = is_playing;

                let (seq, sampled_at) = {
                    let mut clock = clock.lock().unwrap();
                    (clock.next_seq(), clock.room_now(time::wall_now()))
                };

                let state = HostState {
                    room_id: room_id.clone(),
                    track_id: track_id.clone(),
                    is_playing,
                    host_pos_ms: pos_ms,
                    sampled_at_room_time_ms: sampled_at,
                    epoch,
                    seq,
                };
                let _ = socket.broadcast(&Message::HostState(state)).await;
            }

            Some(event) = event_rx.recv() => {
                match event {
                    Event::Started { outcome, .. } => {
                        log::info!("host playback started, error {}ms", outcome.error_ms);
                        stats.start_error_ms.observe(outcome.error_ms);
                        started = true;
                        was_playing = true;
                    }
                    Event::CatchUpFinished { .. } | Event::TrackVerified { .. } => {
                        // client-side events, never emitted on the host
                    }
                }
            }
        }
    }
}

fn schedule_start(
    scheduler: &StartScheduler,
    clock: ClockHandle,
    descriptor: StartDescriptor,
    player: SharedPlayer,
    event_tx: &mpsc::UnboundedSender<Event>,
) -> bool {
    let (epoch, seq) = (descriptor.epoch, descriptor.seq);
    let start_pos = descriptor.start_pos_ms;

    let prepare_player = player.clone();
    let prepare = move || async move {
        let mut player = prepare_player.lock().unwrap();
        player.seek(start_pos).map_err(|e| e.to_string())
    };

    let tx = event_tx.clone();
    let on_start = move |outcome: StartOutcome| {
        if let Err(e) = player.lock().unwrap().play() {
            log::error!("play failed at start time: {e}");
            return;
        }
        let _ = tx.send(Event::Started { epoch, seq, outcome });
    };

    scheduler.schedule(clock, descriptor, prepare, on_start)
}

// ---------------------------------------------------------------------------
// client
// ---------------------------------------------------------------------------

pub async fn run_client(opt: JoinOpt) -> Result<(), RunError> {
    let stats = stats::get();
    let socket = ProtocolSocket::new(Socket::open(opt.socket)?);
    let player: SharedPlayer = player::shared(NullPlayer::new());
    let clock = Arc::new(Mutex::new(RoomClock::new()));
    let clock_handle = ClockHandle(clock.clone());

    let (calibration, latency) =
        config::clamp_calibration(opt.calibration_offset_ms, opt.latency_comp_ms);
    let latency_comp = calibration + latency;

    let ks_config = match opt.profile {
        Profile::Default => KeepSyncConfig::default(),
        Profile::IosSafe => KeepSyncConfig::ios_safe(),
    };
    let mut keepsync = KeepSync::new(ks_config);
    let mut metrics = SyncMetrics::new();
    let mut catchup = CatchUp::new();
    let mut clock_task = ClockTask::new();
    let scheduler = StartScheduler::new();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let cache_dir = match &opt.cache_dir {
        Some(dir) => dir.clone(),
        None => xdg::BaseDirectories::new()
            .unwrap()
            .create_cache_directory("unison")
            .map_err(RunError::CacheDir)?,
    };
    let cache = Arc::new(TrackCache::new(cache_dir));

    let room_id = RoomId(opt.room.clone());
    let peer_id = generate_peer_id();

    log::info!("joining room {room_id} as {peer_id} (latency comp {latency_comp}ms)");

    socket
        .broadcast(&Message::Hello {
            proto_ver: unison_protocol::PROTO_VERSION,
            room_id: room_id.clone(),
            peer_id: peer_id.clone(),
            role: Role::Client,
            device_info: device_info(),
        })
        .await
        .map_err(RunError::Transport)?;

    let mut host_addr: Option<PeerAddr> = None;
    let mut host_ring: VecDeque<HostState> = VecDeque::with_capacity(HOST_STATE_RING);
    let mut last_state: Option<(Epoch, Seq)> = None;
    let mut host_playing = false;
    let mut announced: Option<TrackAnnounce> = None;
    let mut track_path: Option<PathBuf> = None;
    let mut verify_in_flight = false;
    let mut seek_echo: Option<SeekEcho> = None;
    let mut pending_start: Option<StartDescriptor> = None;

    let mut ping_at = tokio::time::Instant::now();

    loop {
        tokio::select! {
            result = socket.recv_from(time::wall_now) => {
                let (message, peer) = result.map_err(RunError::Transport)?;

                match message {
                    Message::Welcome { session_id, server_now_ms } => {
                        log::info!("welcomed into session {session_id}, host clock at {server_now_ms:?}");
                        host_addr = Some(peer);
                    }

                    Message::Pong { seq, t1_server_ms, .. } => {
                        host_addr.get_or_insert(peer);
                        let Some(sample) = clock_task.on_pong(seq, t1_server_ms, time::wall_now()) else {
                            continue;
                        };

                        let outcome = clock.lock().unwrap().on_sample(sample);
                        publish_clock_stats(&stats, &clock);

                        if let SampleOutcome::Accepted { lock_edge: Some(true) } = outcome {
                            try_catch_up(
                                &mut catchup, &host_ring, &clock_handle, &announced,
                                &track_path, host_playing, latency_comp,
                                &player, &event_tx,
                            );
                        }
                    }

                    Message::TrackAnnounce(announce) => {
                        if announce.room_id != room_id {
                            continue;
                        }
                        let already = announced.as_ref()
                            .is_some_and(|a| a.track_id == announce.track_id && track_path.is_some());
                        if already || verify_in_flight {
                            continue;
                        }

                        log::info!("track announced: {} ({} bytes)", announce.track_id, announce.size_bytes);
                        verify_in_flight = true;
                        announced = Some(announce.clone());

                        let cache = cache.clone();
                        let tx = event_tx.clone();
                        tokio::spawn(async move {
                            let started_at = Instant::now();
                            let result = cache.verify(&announce).await;
                            let _ = tx.send(Event::TrackVerified {
                                track_id: announce.track_id.clone(),
                                started_at,
                                result,
                            });
                        });
                    }

                    Message::StartAt(descriptor) => {
                        host_addr.get_or_insert(peer);
                        let Some(path) = track_path.clone() else {
                            // the download may still be verifying; hold
                            // the descriptor until the track is ready
                            log::info!("start_at for {} before track ready, deferring", descriptor.track_id);
                            pending_start = Some(descriptor);
                            continue;
                        };

                        schedule_client_start(
                            &scheduler, &clock_handle, descriptor, path, &player, &event_tx,
                        );
                    }

                    Message::HostState(state) => {
                        host_addr.get_or_insert(peer);
                        if state.room_id != room_id {
                            continue;
                        }
                        if !accepts_host_state(last_state, state.epoch, state.seq) {
                            continue;
                        }
                        last_state = Some((state.epoch, state.seq));

                        if host_ring.len() == HOST_STATE_RING {
                            host_ring.pop_front();
                        }
                        host_ring.push_back(state.clone());

                        // a resume re-arms the once-per-epoch catch-up
                        if state.is_playing && !host_playing {
                            catchup.on_playing_edge();
                        }
                        host_playing = state.is_playing;

                        // ping gently while idle; a resume needs the
                        // clock sharp again, which the recovery burst
                        // handles
                        clock_task.set_foreground(host_playing);

                        let caught_up = try_catch_up(
                            &mut catchup, &host_ring, &clock_handle, &announced,
                            &track_path, host_playing, latency_comp,
                            &player, &event_tx,
                        );
                        if caught_up || catchup.in_flight() {
                            continue;
                        }

                        run_keepsync(
                            &state, &mut keepsync, &mut metrics, &mut seek_echo,
                            &clock, &player, latency_comp, &stats,
                        );
                    }

                    Message::PeerJoin { peer_id: joined, .. } => {
                        log::debug!("peer joined room: {joined}");
                    }
                    Message::PeerLeave { peer_id: left, .. } => {
                        log::debug!("peer left room: {left}");
                    }
                    _ => {
                        // hello/ping/ready flow client -> host only
                    }
                }
            }

            _ = tokio::time::sleep_until(ping_at) => {
                let (seq, t0) = clock_task.make_ping(time::wall_now());
                let ping = Message::Ping { seq, t0_client_ms: t0 };

                let sent = match host_addr {
                    Some(addr) => socket.send_to(&ping, addr).await,
                    None => socket.broadcast(&ping).await,
                };
                if let Err(e) = sent {
                    log::warn!("sending ping: {e}");
                }
                log::trace!("ping {seq} sent, {} in flight", clock_task.in_flight());

                ping_at = tokio::time::Instant::now() + clock_task.interval();
            }

            Some(event) = event_rx.recv() => {
                match event {
                    Event::TrackVerified { track_id, started_at, result } => {
                        verify_in_flight = false;
                        let prepare_ms = started_at.elapsed().as_millis() as i64;

                        match result {
                            Ok(path) => {
                                log::info!("track {track_id} verified in {prepare_ms}ms");
                                track_path = Some(path.clone());

                                if let Some(addr) = host_addr {
                                    let _ = socket.send_to(&Message::ClientReady {
                                        track_id,
                                        cached: true,
                                        local_path: path.display().to_string(),
                                        prepare_ms,
                                    }, addr).await;
                                }

                                // a start that arrived mid-verification
                                // can run now, unless its moment is
                                // long gone and catch-up is the better
                                // path
                                if let Some(descriptor) = pending_start.take() {
                                    let overdue = -descriptor
                                        .start_at_room_time_ms
                                        .millis_since(clock_handle.room_now());
                                    if overdue < 2_000 {
                                        schedule_client_start(
                                            &scheduler, &clock_handle, descriptor,
                                            path.clone(), &player, &event_tx,
                                        );
                                    }
                                }

                                try_catch_up(
                                    &mut catchup, &host_ring, &clock_handle, &announced,
                                    &track_path, host_playing, latency_comp,
                                    &player, &event_tx,
                                );
                            }
                            Err(e) => {
                                log::warn!("track {track_id} failed verification: {e}");
                                if let Some(addr) = host_addr {
                                    let _ = socket.send_to(&Message::ClientReadyError {
                                        track_id,
                                        error_code: e.code(),
                                        error_message: e.to_string(),
                                    }, addr).await;
                                }
                            }
                        }
                    }

                    Event::Started { epoch, seq, outcome } => {
                        stats.start_error_ms.observe(outcome.error_ms);
                        if let Some(addr) = host_addr {
                            let _ = socket.send_to(&Message::ClientStartReport {
                                peer_id: peer_id.clone(),
                                epoch,
                                seq,
                                actual_start_room_time_ms: outcome.actual_start,
                                start_error_ms: outcome.error_ms,
                            }, addr).await;
                        }
                    }

                    Event::CatchUpFinished { ok } => {
                        catchup.finish();
                        if ok {
                            log::info!("catch-up complete");
                        }
                    }
                }
            }
        }
    }
}

/// Hand a start descriptor to the scheduler with the client's prepare
/// (load + seek) and play-then-report callbacks.
fn schedule_client_start(
    scheduler: &StartScheduler,
    clock: &ClockHandle,
    descriptor: StartDescriptor,
    path: PathBuf,
    player: &SharedPlayer,
    event_tx: &mpsc::UnboundedSender<Event>,
) {
    let start_pos = descriptor.start_pos_ms;
    let (epoch, seq) = (descriptor.epoch, descriptor.seq);

    let prepare_player = player.clone();
    let prepare = move || async move {
        let mut player = prepare_player.lock().unwrap();
        player.load(&path).map_err(|e| e.to_string())?;
        player.seek(start_pos).map_err(|e| e.to_string())
    };

    let play_player = player.clone();
    let tx = event_tx.clone();
    let on_start = move |outcome: StartOutcome| {
        if let Err(e) = play_player.lock().unwrap().play() {
            log::error!("play failed at start time: {e}");
            return;
        }
        let _ = tx.send(Event::Started { epoch, seq, outcome });
    };

    scheduler.schedule(clock.clone(), descriptor, prepare, on_start);
}

/// Evaluate the catch-up trigger; spawn the aligned join if all three
/// conditions hold and the gates pass. Returns true when an attempt was
/// started on this call.
#[allow(clippy::too_many_arguments)]
fn try_catch_up(
    catchup: &mut CatchUp,
    host_ring: &VecDeque<HostState>,
    clock: &ClockHandle,
    announced: &Option<TrackAnnounce>,
    track_path: &Option<PathBuf>,
    host_playing: bool,
    latency_comp: i64,
    player: &SharedPlayer,
    event_tx: &mpsc::UnboundedSender<Event>,
) -> bool {
    let Some(state) = host_ring.back() else {
        return false;
    };
    let Some(announce) = announced else {
        return false;
    };
    let Some(path) = track_path.clone() else {
        return false;
    };
    if !host_playing || !clock.0.lock().unwrap().is_locked() {
        return false;
    }
    if !catchup.try_begin(state.epoch, time::wall_now()) {
        return false;
    }

    let plan = CatchUp::plan(state, clock.room_now(), latency_comp, announce.duration_ms);
    log::info!(
        "catching up: seek to {}ms, play at {:?}",
        plan.seek_pos_ms,
        plan.target_room_time
    );

    let clock = clock.clone();
    let player = player.clone();
    let tx = event_tx.clone();

    tokio::spawn(async move {
        let prepared = {
            let mut player = player.lock().unwrap();
            player
                .load(&path)
                .and_then(|_| player.seek(plan.seek_pos_ms))
        };

        let ok = match prepared {
            Ok(()) => {
                let remaining = plan.target_room_time.millis_since(clock.room_now());
                if remaining > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(remaining as u64)).await;
                }
                match player.lock().unwrap().play() {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("catch-up play failed: {e}");
                        false
                    }
                }
            }
            Err(e) => {
                log::warn!("catch-up prepare failed: {e}");
                false
            }
        };

        let _ = tx.send(Event::CatchUpFinished { ok });
    });

    true
}

/// One KeepSync evaluation: gather the client snapshot, decide, apply
/// protection restrictions, execute, record.
#[allow(clippy::too_many_arguments)]
fn run_keepsync(
    state: &HostState,
    keepsync: &mut KeepSync,
    metrics: &mut SyncMetrics,
    seek_echo: &mut Option<SeekEcho>,
    clock: &Arc<Mutex<RoomClock>>,
    player: &SharedPlayer,
    latency_comp: i64,
    stats: &stats::SyncStats,
) {
    let now_wall = time::wall_now();

    let (client_pos, duration, playing) = {
        let mut player = player.lock().unwrap();
        match player.position() {
            Ok(pos) => (pos, player.duration().unwrap_or(0), player.is_playing()),
            Err(_) => return, // nothing loaded yet; catch-up will align us
        }
    };
    if !playing {
        return;
    }

    // ignore host states until a just-issued seek settles
    if let Some(echo) = seek_echo.as_ref() {
        if echo.suppresses(now_wall, client_pos) {
            return;
        }
        *seek_echo = None;
    }

    let snapshot = {
        let clock = clock.lock().unwrap();
        ClientSnapshot {
            room_now: clock.room_now(now_wall),
            now_wall,
            client_pos_ms: client_pos,
            duration_ms: duration,
            latency_comp_ms: latency_comp,
            clock_locked: clock.is_locked(),
            jitter_ms: clock.jitter_ms(),
            rtt_ms: clock.rtt_ms(),
        }
    };

    let decision = keepsync.decide(state, &snapshot);

    let mut action = decision.action;
    if metrics.in_protection() {
        action = restrict_action(action, decision.delta_ms);
    }

    let kind = match action {
        Action::Noop(_) => ActionKind::Noop,
        Action::SetSpeed { .. } => ActionKind::SetSpeed,
        Action::Seek { .. } => ActionKind::Seek,
    };

    match action {
        Action::Noop(reason) => {
            log::trace!("keepsync noop: {reason:?} (delta {}ms)", decision.delta_ms);
        }
        Action::SetSpeed { rate, reason } => {
            log::debug!("keepsync speed {rate:.4} ({reason:?}, delta {}ms)", decision.delta_ms);
            if let Err(e) = player.lock().unwrap().set_speed(rate) {
                log::warn!("set_speed failed: {e}");
            }
            stats.sync_speed_sets.increment();
        }
        Action::Seek { target_ms } => {
            log::info!("keepsync seek to {target_ms}ms (delta {}ms)", decision.delta_ms);
            if let Err(e) = player.lock().unwrap().seek(target_ms) {
                log::warn!("seek failed: {e}");
            }
            *seek_echo = Some(SeekEcho::new(now_wall, target_ms));
            stats.sync_seeks.increment();
        }
    }

    let stale = action == Action::Noop(NoopReason::StaleHostState);
    if stale {
        stats.sync_stale_drops.increment();
    }

    let event = metrics.record(
        SyncSample {
            ts: snapshot.room_now,
            delta_ms: decision.delta_ms,
            audible_pos_ms: client_pos,
            target_pos_ms: decision.target_pos_ms,
            rtt_ms: snapshot.rtt_ms,
            jitter_ms: snapshot.jitter_ms,
            speed: keepsync.current_speed(),
            action: kind,
        },
        stale,
    );

    match event {
        Some(ProtectionEvent::Entered(trigger)) => {
            log::warn!("entering protection mode: {trigger:?}");
            stats.protection_entries.increment();
            stats.protection_active.observe(true);
        }
        Some(ProtectionEvent::Exited) => {
            stats.protection_active.observe(false);
        }
        None => {}
    }

    stats.sync_delta_ms.observe(decision.delta_ms);
    stats
        .sync_speed_milli
        .observe(crate::stats::value::Milli(keepsync.current_speed()));
}

fn publish_clock_stats(stats: &stats::SyncStats, clock: &Arc<Mutex<RoomClock>>) {
    let snapshot = clock.lock().unwrap().snapshot();
    stats.clock_offset_ms.observe(snapshot.offset_ms);
    stats.clock_rtt_ms.observe(snapshot.rtt_ms);
    stats.clock_jitter_ms.observe(snapshot.jitter_ms);
    stats.clock_locked.observe(snapshot.locked);
    stats.clock_samples.observe(snapshot.sample_count as i64);
    stats.clock_samples_dropped.observe(snapshot.dropped_count as i64);
}
