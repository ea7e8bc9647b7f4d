//! The per-endpoint connection protocol.
//!
//! One [`UdpProtocol`] instance manages everything towards a single remote
//! peer: the synchronization handshake, redundant input transmission with
//! acks, quality reports and ping measurement, keepalives, liveness
//! tracking and checksum exchange for desync detection.
//!
//! The protocol is strictly poll-driven. It never blocks and never owns a
//! socket; outgoing messages accumulate in a queue until the session flushes
//! them with [`UdpProtocol::send_all_messages`].

use std::collections::{BTreeMap, VecDeque};
use std::collections::vec_deque::Drain;

use tracing::{trace, warn};
use web_time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::frame_info::PlayerInput;
use crate::network::compression::Compression;
use crate::network::messages::{
    ChecksumReport, ConnectionStatus, Input, InputAck, Message, MessageBody, MessageHeader,
    QualityReply, QualityReport, SyncReply, SyncRequest,
};
use crate::network::network_stats::NetworkStats;
use crate::rng::Pcg32;
use crate::wire::{self, Serde};
use crate::{Config, DesyncDetection, Frame, FramelockError, NonBlockingSocket, PlayerHandle};

const NUM_SYNC_PACKETS: u32 = 5;
const UDP_SHUTDOWN_TIMER: u64 = 5000;
const PENDING_OUTPUT_SIZE: usize = 128;
const SYNC_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const RUNNING_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(200);
const QUALITY_REPORT_INTERVAL: Duration = Duration::from_millis(200);

/// Remote checksums kept around waiting for the local frame to be confirmed.
const MAX_CHECKSUM_HISTORY_SIZE: usize = 32;

pub(crate) fn millis_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The serialized inputs of all players this endpoint transmits, for a
/// single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InputBytes {
    pub frame: Frame,
    pub bytes: Vec<u8>,
}

impl InputBytes {
    /// A blank entry: default-encoded inputs for `num_players` players.
    pub(crate) fn zeroed<T: Config>(num_players: usize) -> Self {
        let size = T::Input::default().serde_size() * num_players;
        Self {
            frame: Frame::NULL,
            bytes: vec![0; size],
        }
    }

    /// Concatenates the given inputs in player handle order. All inputs
    /// must belong to the same frame.
    pub(crate) fn from_inputs<T: Config>(
        inputs: &BTreeMap<PlayerHandle, PlayerInput<T::Input>>,
    ) -> Self {
        let mut frame = Frame::NULL;
        let size = T::Input::default().serde_size() * inputs.len();
        let mut bytes = Vec::with_capacity(size);
        for player_input in inputs.values() {
            assert!(
                frame.is_null() || player_input.frame.is_null() || frame == player_input.frame,
                "inputs from mixed frames"
            );
            if player_input.frame.is_valid() {
                frame = player_input.frame;
            }
            player_input.input.serialize(&mut bytes);
        }
        Self { frame, bytes }
    }

    /// Splits the byte blob back into one input per player.
    pub(crate) fn to_inputs<T: Config>(&self, num_players: usize) -> Vec<PlayerInput<T::Input>> {
        assert!(num_players != 0);
        assert!(self.bytes.len() % num_players == 0);
        let size = self.bytes.len() / num_players;
        self.bytes
            .chunks_exact(size)
            .map(|chunk| {
                let input = wire::decode::<T::Input>(chunk).unwrap_or_default();
                PlayerInput::new(self.frame, input)
            })
            .collect()
    }
}

/// Events a protocol endpoint surfaces to its owning session.
pub(crate) enum Event<T>
where
    T: Config,
{
    /// A sync roundtrip completed, `count` of `total` done.
    Synchronizing { total: u32, count: u32 },
    /// The handshake finished, the endpoint is running.
    Synchronized,
    /// A confirmed remote input arrived.
    Input {
        input: PlayerInput<T::Input>,
        player: PlayerHandle,
    },
    /// The endpoint is now considered disconnected.
    Disconnected,
    /// No packets arrived for a while, disconnect is imminent.
    NetworkInterrupted { disconnect_timeout: u64 },
    /// Packets arrived again after an interruption.
    NetworkResumed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ProtocolState {
    Initializing,
    Synchronizing,
    Running,
    Disconnected,
    Shutdown,
}

/// The connection to a single remote endpoint.
pub(crate) struct UdpProtocol<T>
where
    T: Config,
{
    num_players: usize,
    local_players: usize,
    handles: Vec<PlayerHandle>,
    send_queue: VecDeque<Message>,
    event_queue: VecDeque<Event<T>>,

    // state
    state: ProtocolState,
    sync_remaining_roundtrips: u32,
    sync_random_requests: Vec<u32>,
    running_last_quality_report: Instant,
    running_last_input_recv: Instant,
    disconnect_notify_sent: bool,
    disconnect_event_sent: bool,

    // constants
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    shutdown_timeout: Instant,
    fps: u32,
    magic: u16,

    // peer
    peer_addr: T::Address,
    remote_magic: u16,
    peer_connect_status: Vec<ConnectionStatus>,

    // input compression
    pending_output: VecDeque<InputBytes>,
    last_acked_input: InputBytes,
    max_prediction: usize,
    recv_inputs: BTreeMap<Frame, InputBytes>,
    last_recv_frame: Frame,

    // time sync
    time_sync_layer: crate::time_sync::TimeSync,
    local_frame_advantage: i32,
    remote_frame_advantage: i32,

    // network
    stats_start_time: u64,
    packets_sent: u64,
    round_trip_time: u64,
    last_send_time: Instant,
    last_recv_time: Instant,

    // desync detection
    pending_checksums: BTreeMap<Frame, u64>,
    desync_detection: DesyncDetection,

    rng: Pcg32,
    compression: Compression,
}

impl<T: Config> UdpProtocol<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        mut handles: Vec<PlayerHandle>,
        peer_addr: T::Address,
        num_players: usize,
        local_players: usize,
        max_prediction: usize,
        disconnect_timeout: Duration,
        disconnect_notify_start: Duration,
        fps: u32,
        desync_detection: DesyncDetection,
    ) -> Self {
        let mut rng = Pcg32::from_entropy();
        let magic = rng.next_magic();

        handles.sort_unstable();
        let recv_player_num = handles.len();

        // the null frame entry serves as the decode reference for the very
        // first input batch
        let mut recv_inputs = BTreeMap::new();
        recv_inputs.insert(Frame::NULL, InputBytes::zeroed::<T>(recv_player_num));

        let now = Instant::now();
        Self {
            num_players,
            local_players,
            handles,
            send_queue: VecDeque::new(),
            event_queue: VecDeque::new(),

            state: ProtocolState::Initializing,
            sync_remaining_roundtrips: NUM_SYNC_PACKETS,
            sync_random_requests: Vec::new(),
            running_last_quality_report: now,
            running_last_input_recv: now,
            disconnect_notify_sent: false,
            disconnect_event_sent: false,

            disconnect_timeout,
            disconnect_notify_start,
            shutdown_timeout: now,
            fps,
            magic,

            peer_addr,
            remote_magic: 0,
            peer_connect_status: vec![ConnectionStatus::default(); num_players],

            pending_output: VecDeque::with_capacity(PENDING_OUTPUT_SIZE),
            last_acked_input: InputBytes::zeroed::<T>(local_players),
            max_prediction,
            recv_inputs,
            last_recv_frame: Frame::NULL,

            time_sync_layer: crate::time_sync::TimeSync::default(),
            local_frame_advantage: 0,
            remote_frame_advantage: 0,

            stats_start_time: 0,
            packets_sent: 0,
            round_trip_time: 0,
            last_send_time: now,
            last_recv_time: now,

            pending_checksums: BTreeMap::new(),
            desync_detection,

            rng,
            compression: Compression::default(),
        }
    }

    pub(crate) fn handles(&self) -> &[PlayerHandle] {
        &self.handles
    }

    pub(crate) fn peer_addr(&self) -> &T::Address {
        &self.peer_addr
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        matches!(
            self.state,
            ProtocolState::Running | ProtocolState::Disconnected | ProtocolState::Shutdown
        )
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state == ProtocolState::Running
    }

    pub(crate) fn is_handling_message(&self, addr: &T::Address) -> bool {
        self.peer_addr == *addr
    }

    pub(crate) fn peer_connect_status(&self, handle: PlayerHandle) -> ConnectionStatus {
        self.peer_connect_status[handle.as_usize()]
    }

    pub(crate) fn pending_checksums(&mut self) -> &mut BTreeMap<Frame, u64> {
        &mut self.pending_checksums
    }

    /// Marks the endpoint disconnected and starts the shutdown countdown.
    pub(crate) fn disconnect(&mut self) {
        if self.state == ProtocolState::Shutdown {
            return;
        }
        self.state = ProtocolState::Disconnected;
        self.shutdown_timeout = Instant::now() + Duration::from_millis(UDP_SHUTDOWN_TIMER);
    }

    /// Starts the synchronization handshake.
    pub(crate) fn synchronize(&mut self) {
        assert_eq!(self.state, ProtocolState::Initializing);
        self.state = ProtocolState::Synchronizing;
        self.sync_remaining_roundtrips = NUM_SYNC_PACKETS;
        self.stats_start_time = millis_since_epoch();
        self.send_sync_request();
    }

    /// Estimates how many frames the remote has advanced past our view of
    /// it, and records our advantage relative to it.
    pub(crate) fn update_local_frame_advantage(&mut self, local_frame: Frame) {
        if local_frame.is_null() || self.last_recv_frame.is_null() {
            return;
        }
        let ping = (self.round_trip_time / 2) as i32;
        let remote_frame = self.last_recv_frame.as_i32() + ping * self.fps as i32 / 1000;
        self.local_frame_advantage = remote_frame - local_frame.as_i32();
    }

    pub(crate) fn average_frame_advantage(&self) -> i32 {
        self.time_sync_layer.average_frame_advantage()
    }

    pub(crate) fn network_stats(&self) -> Result<NetworkStats, FramelockError> {
        if self.state != ProtocolState::Synchronizing && self.state != ProtocolState::Running {
            return Err(FramelockError::NotSynchronized);
        }
        let secs = (millis_since_epoch().saturating_sub(self.stats_start_time)) / 1000;
        if secs == 0 {
            return Err(FramelockError::NotSynchronized);
        }

        Ok(NetworkStats {
            ping: self.round_trip_time,
            send_queue_len: self.pending_output.len(),
            local_frames_behind: self.local_frame_advantage,
            remote_frames_behind: self.remote_frame_advantage,
        })
    }

    /// Drives retransmission and liveness timers, then drains all queued
    /// events.
    pub(crate) fn poll(&mut self, connect_status: &[ConnectionStatus]) -> Drain<'_, Event<T>> {
        let now = Instant::now();
        match self.state {
            ProtocolState::Synchronizing => {
                if self.last_send_time + SYNC_RETRY_INTERVAL < now {
                    self.send_sync_request();
                }
            }
            ProtocolState::Running => {
                if self.running_last_input_recv + RUNNING_RETRY_INTERVAL < now {
                    self.send_pending_output(connect_status);
                    self.running_last_input_recv = Instant::now();
                }
                if self.running_last_quality_report + QUALITY_REPORT_INTERVAL < now {
                    self.send_quality_report();
                }
                if self.last_send_time + KEEP_ALIVE_INTERVAL < now {
                    self.send_keep_alive();
                }

                if !self.disconnect_notify_sent
                    && self.last_recv_time + self.disconnect_notify_start < now
                {
                    let remaining = self.disconnect_timeout.saturating_sub(self.disconnect_notify_start);
                    self.event_queue.push_back(Event::NetworkInterrupted {
                        disconnect_timeout: remaining.as_millis() as u64,
                    });
                    self.disconnect_notify_sent = true;
                }

                if !self.disconnect_event_sent
                    && self.last_recv_time + self.disconnect_timeout < now
                {
                    self.event_queue.push_back(Event::Disconnected);
                    self.disconnect_event_sent = true;
                }
            }
            ProtocolState::Disconnected => {
                if self.shutdown_timeout < now {
                    self.state = ProtocolState::Shutdown;
                }
            }
            ProtocolState::Initializing | ProtocolState::Shutdown => (),
        }
        self.event_queue.drain(..)
    }

    /// Flushes all queued messages through the socket. In shutdown, queued
    /// messages are silently dropped instead.
    pub(crate) fn send_all_messages(&mut self, socket: &mut dyn NonBlockingSocket<T::Address>) {
        if self.state == ProtocolState::Shutdown {
            trace!(dropped = self.send_queue.len(), "shutting down, dropping queued messages");
            self.send_queue.clear();
            return;
        }

        for msg in self.send_queue.drain(..) {
            socket.send_to(&msg, &self.peer_addr);
        }
    }

    /// Registers this frame's local inputs and transmits the whole unacked
    /// window. If the remote stops acking for a full window, the endpoint
    /// is given up on.
    pub(crate) fn send_input(
        &mut self,
        inputs: &BTreeMap<PlayerHandle, PlayerInput<T::Input>>,
        connect_status: &[ConnectionStatus],
    ) {
        if !self.is_running() {
            return;
        }
        assert_eq!(inputs.len(), self.local_players);
        let endpoint_data = InputBytes::from_inputs::<T>(inputs);
        self.time_sync_layer.advance_frame(
            endpoint_data.frame,
            self.local_frame_advantage,
            self.remote_frame_advantage,
        );
        self.pending_output.push_back(endpoint_data);

        if self.pending_output.len() > PENDING_OUTPUT_SIZE {
            self.event_queue.push_back(Event::Disconnected);
        }

        self.send_pending_output(connect_status);
    }

    fn send_pending_output(&mut self, connect_status: &[ConnectionStatus]) {
        let Some(first) = self.pending_output.front() else {
            return;
        };
        assert!(
            self.last_acked_input.frame.is_null()
                || self.last_acked_input.frame + 1 == first.frame
        );
        let start_frame = first.frame;

        let bytes = match self.compression.encode(
            &self.last_acked_input.bytes,
            self.pending_output.iter().map(|p| p.bytes.as_slice()),
        ) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "failed to compress pending output, dropping endpoint");
                if !self.disconnect_event_sent {
                    self.event_queue.push_back(Event::Disconnected);
                    self.disconnect_event_sent = true;
                }
                return;
            }
        };

        let body = Input {
            peer_connect_status: connect_status.to_vec(),
            disconnect_requested: self.state == ProtocolState::Disconnected,
            start_frame,
            ack_frame: self.last_recv_frame,
            bytes,
        };
        self.queue_message(MessageBody::Input(body));
    }

    fn send_input_ack(&mut self) {
        self.queue_message(MessageBody::InputAck(InputAck {
            ack_frame: self.last_recv_frame,
        }));
    }

    fn send_keep_alive(&mut self) {
        self.queue_message(MessageBody::KeepAlive);
    }

    fn send_sync_request(&mut self) {
        let random_number = self.rng.next_u32();
        self.sync_random_requests.push(random_number);
        self.queue_message(MessageBody::SyncRequest(SyncRequest {
            random_request: random_number,
        }));
    }

    fn send_quality_report(&mut self) {
        self.running_last_quality_report = Instant::now();
        let frame_advantage = self
            .local_frame_advantage
            .clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        self.queue_message(MessageBody::QualityReport(QualityReport {
            frame_advantage,
            ping: millis_since_epoch(),
        }));
    }

    pub(crate) fn send_checksum_report(&mut self, frame_to_send: Frame, checksum: u64) {
        self.queue_message(MessageBody::ChecksumReport(ChecksumReport {
            checksum,
            frame: frame_to_send,
        }));
    }

    fn queue_message(&mut self, body: MessageBody) {
        let message = Message {
            header: MessageHeader { magic: self.magic },
            body,
        };
        self.packets_sent += 1;
        self.last_send_time = Instant::now();
        self.send_queue.push_back(message);
    }

    /// Drops acked inputs from the retransmit window, keeping the newest
    /// acked one as the next compression reference.
    pub(crate) fn pop_pending_output(&mut self, ack_frame: Frame) {
        while let Some(input) = self.pending_output.front() {
            if input.frame <= ack_frame {
                self.last_acked_input = self
                    .pending_output
                    .pop_front()
                    .unwrap_or_else(|| InputBytes::zeroed::<T>(self.local_players));
            } else {
                break;
            }
        }
    }

    /// Dispatches a received message. Messages with a stale or foreign
    /// magic are dropped, as is everything after shutdown.
    pub(crate) fn handle_message(&mut self, msg: &Message) {
        if self.state == ProtocolState::Shutdown {
            return;
        }
        if self.remote_magic != 0 && msg.header.magic != self.remote_magic {
            return;
        }

        self.last_recv_time = Instant::now();

        if self.disconnect_notify_sent && self.state == ProtocolState::Running {
            self.disconnect_notify_sent = false;
            self.event_queue.push_back(Event::NetworkResumed);
        }

        match &msg.body {
            MessageBody::SyncRequest(body) => self.on_sync_request(*body),
            MessageBody::SyncReply(body) => self.on_sync_reply(msg.header, *body),
            MessageBody::Input(body) => self.on_input(body),
            MessageBody::InputAck(body) => self.pop_pending_output(body.ack_frame),
            MessageBody::QualityReport(body) => self.on_quality_report(*body),
            MessageBody::QualityReply(body) => self.on_quality_reply(*body),
            MessageBody::ChecksumReport(body) => self.on_checksum_report(*body),
            MessageBody::KeepAlive => (),
        }
    }

    fn on_sync_request(&mut self, body: SyncRequest) {
        self.queue_message(MessageBody::SyncReply(SyncReply {
            random_reply: body.random_request,
        }));
    }

    fn on_sync_reply(&mut self, header: MessageHeader, body: SyncReply) {
        if self.state != ProtocolState::Synchronizing {
            return;
        }
        // only accept replies to nonces we actually sent
        let Some(pos) = self
            .sync_random_requests
            .iter()
            .position(|&nonce| nonce == body.random_reply)
        else {
            return;
        };
        self.sync_random_requests.swap_remove(pos);

        self.sync_remaining_roundtrips -= 1;
        if self.sync_remaining_roundtrips > 0 {
            self.event_queue.push_back(Event::Synchronizing {
                total: NUM_SYNC_PACKETS,
                count: NUM_SYNC_PACKETS - self.sync_remaining_roundtrips,
            });
            self.send_sync_request();
        } else {
            self.state = ProtocolState::Running;
            self.event_queue.push_back(Event::Synchronized);
            self.remote_magic = header.magic;
        }
    }

    fn on_input(&mut self, body: &Input) {
        // inputs double as acks for the other direction
        self.pop_pending_output(body.ack_frame);

        if body.disconnect_requested {
            if self.state != ProtocolState::Disconnected && !self.disconnect_event_sent {
                self.event_queue.push_back(Event::Disconnected);
                self.disconnect_event_sent = true;
            }
        } else {
            assert_eq!(self.num_players, self.peer_connect_status.len());
            for (status, remote) in self
                .peer_connect_status
                .iter_mut()
                .zip(&body.peer_connect_status)
            {
                status.disconnected = remote.disconnected || status.disconnected;
                status.last_frame = status.last_frame.max(remote.last_frame);
            }
        }

        assert!(self.last_recv_frame.is_null() || self.last_recv_frame + 1 >= body.start_frame);

        // the batch can only be decoded against the input just before its
        // start frame; without that reference the batch is dropped and a
        // retransmission with an older start frame will succeed instead
        let decode_frame = if self.last_recv_frame.is_null() {
            Frame::NULL
        } else {
            body.start_frame - 1
        };
        let Some(decode_input) = self.recv_inputs.get(&decode_frame) else {
            trace!(start_frame = %body.start_frame, "no decode reference yet, dropping input batch");
            return;
        };

        self.running_last_input_recv = Instant::now();
        let recv_inputs = match self.compression.decode(&decode_input.bytes, &body.bytes) {
            Ok(inputs) => inputs,
            Err(err) => {
                warn!(%err, "failed to decode input payload, dropping packet");
                return;
            }
        };

        for (i, input_bytes) in recv_inputs.into_iter().enumerate() {
            let input_frame = body.start_frame + i as i32;
            if input_frame <= self.last_recv_frame {
                continue;
            }
            let input_data = InputBytes {
                frame: input_frame,
                bytes: input_bytes,
            };
            self.last_recv_frame = self.last_recv_frame.max(input_data.frame);

            let inputs = input_data.to_inputs::<T>(self.handles.len());
            self.recv_inputs.insert(input_data.frame, input_data);
            for (input, &player) in inputs.into_iter().zip(&self.handles) {
                self.event_queue.push_back(Event::Input { input, player });
            }
        }

        self.send_input_ack();

        // prune old references, then recompute the newest received frame
        let oldest_to_keep = self.last_recv_frame - 2 * self.max_prediction as i32;
        self.recv_inputs.retain(|&frame, _| frame >= oldest_to_keep);
        self.last_recv_frame = self
            .recv_inputs
            .keys()
            .max()
            .copied()
            .unwrap_or(Frame::NULL);
    }

    fn on_quality_report(&mut self, body: QualityReport) {
        self.remote_frame_advantage = i32::from(body.frame_advantage);
        self.queue_message(MessageBody::QualityReply(QualityReply { pong: body.ping }));
    }

    fn on_quality_reply(&mut self, body: QualityReply) {
        self.round_trip_time = millis_since_epoch().saturating_sub(body.pong);
    }

    fn on_checksum_report(&mut self, body: ChecksumReport) {
        let interval = match self.desync_detection {
            DesyncDetection::On { interval } => interval,
            DesyncDetection::Off => {
                warn!("received checksum report but desync detection is off, check for consistent configuration");
                1
            }
        };

        if self.pending_checksums.len() >= MAX_CHECKSUM_HISTORY_SIZE {
            let oldest_frame_to_keep =
                body.frame - (MAX_CHECKSUM_HISTORY_SIZE as i32 - 1) * interval as i32;
            self.pending_checksums
                .retain(|&frame, _| frame >= oldest_frame_to_keep);
        }
        self.pending_checksums.insert(body.frame, body.checksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ByteReader, DecodeError};

    #[derive(Copy, Clone, PartialEq, Default, Debug)]
    struct TestInput {
        value: u16,
    }

    impl Serde for TestInput {
        fn serde_size(&self) -> usize {
            2
        }
        fn serialize(&self, out: &mut Vec<u8>) {
            self.value.serialize(out);
        }
        fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
            Ok(Self { value: r.read_u16()? })
        }
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type State = u32;
        type Address = usize;
    }

    fn endpoint() -> UdpProtocol<TestConfig> {
        UdpProtocol::new(
            vec![PlayerHandle::new(1)],
            7,
            2,
            1,
            8,
            Duration::from_millis(2000),
            Duration::from_millis(500),
            60,
            DesyncDetection::Off,
        )
    }

    fn drain_queued(endpoint: &mut UdpProtocol<TestConfig>) -> Vec<Message> {
        struct Capture(Vec<(usize, Message)>);
        impl NonBlockingSocket<usize> for Capture {
            fn send_to(&mut self, msg: &Message, addr: &usize) {
                self.0.push((*addr, msg.clone()));
            }
            fn receive_all_messages(&mut self) -> Vec<(usize, Message)> {
                Vec::new()
            }
        }
        let mut capture = Capture(Vec::new());
        endpoint.send_all_messages(&mut capture);
        capture.0.into_iter().map(|(_, msg)| msg).collect()
    }

    fn synchronize_pair(
        local: &mut UdpProtocol<TestConfig>,
        remote: &mut UdpProtocol<TestConfig>,
    ) {
        local.synchronize();
        remote.synchronize();
        // enough exchange rounds to finish the handshake and quiesce any
        // lingering replies
        for _ in 0..2 * NUM_SYNC_PACKETS {
            for msg in drain_queued(local) {
                remote.handle_message(&msg);
            }
            for msg in drain_queued(remote) {
                local.handle_message(&msg);
            }
        }
        assert!(local.is_running());
        assert!(remote.is_running());
        local.poll(&[]).for_each(drop);
        remote.poll(&[]).for_each(drop);
    }

    #[test]
    fn input_bytes_round_trip() {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            PlayerHandle::new(0),
            PlayerInput::new(Frame::new(3), TestInput { value: 500 }),
        );
        inputs.insert(
            PlayerHandle::new(1),
            PlayerInput::new(Frame::new(3), TestInput { value: 2 }),
        );
        let bytes = InputBytes::from_inputs::<TestConfig>(&inputs);
        assert_eq!(bytes.frame, Frame::new(3));
        assert_eq!(bytes.bytes.len(), 4);
        let decoded = bytes.to_inputs::<TestConfig>(2);
        assert_eq!(decoded[0].input.value, 500);
        assert_eq!(decoded[1].input.value, 2);
        assert_eq!(decoded[0].frame, Frame::new(3));
    }

    #[test]
    fn zeroed_input_bytes_match_default_size() {
        let zeroed = InputBytes::zeroed::<TestConfig>(3);
        assert!(zeroed.frame.is_null());
        assert_eq!(zeroed.bytes.len(), 6);
    }

    #[test]
    fn handshake_completes_after_five_roundtrips() {
        let mut local = endpoint();
        let mut remote = endpoint();
        local.synchronize();
        remote.synchronize();
        assert!(!local.is_synchronized());

        let mut synchronized_events = 0;
        for _ in 0..NUM_SYNC_PACKETS + 1 {
            for msg in drain_queued(&mut local) {
                remote.handle_message(&msg);
            }
            for msg in drain_queued(&mut remote) {
                local.handle_message(&msg);
            }
            for event in local.poll(&[]) {
                if matches!(event, Event::Synchronized) {
                    synchronized_events += 1;
                }
            }
        }
        assert!(local.is_running());
        assert_eq!(synchronized_events, 1);
    }

    #[test]
    fn unsolicited_sync_reply_is_ignored() {
        let mut local = endpoint();
        local.synchronize();
        drain_queued(&mut local);
        local.handle_message(&Message {
            header: MessageHeader { magic: 55 },
            body: MessageBody::SyncReply(SyncReply { random_reply: 0xBAD }),
        });
        assert!(!local.is_synchronized());
    }

    #[test]
    fn foreign_magic_is_dropped_once_synchronized() {
        let mut local = endpoint();
        let mut remote = endpoint();
        synchronize_pair(&mut local, &mut remote);

        // quality report with a bogus magic must not update anything
        local.handle_message(&Message {
            header: MessageHeader { magic: 0 },
            body: MessageBody::QualityReport(QualityReport {
                frame_advantage: 5,
                ping: 0,
            }),
        });
        // the remote magic is nonzero and 0 never matches it
        assert!(drain_queued(&mut local).is_empty());
    }

    #[test]
    fn inputs_flow_between_synchronized_endpoints() {
        let mut local = endpoint();
        let mut remote = endpoint();
        synchronize_pair(&mut local, &mut remote);

        let statuses = vec![ConnectionStatus::default(); 2];
        for frame in 0..3 {
            let mut inputs = BTreeMap::new();
            inputs.insert(
                PlayerHandle::new(0),
                PlayerInput::new(Frame::new(frame), TestInput { value: frame as u16 + 10 }),
            );
            local.send_input(&inputs, &statuses);
        }
        for msg in drain_queued(&mut local) {
            remote.handle_message(&msg);
        }

        let mut received = Vec::new();
        for event in remote.poll(&statuses) {
            if let Event::Input { input, player } = event {
                received.push((player, input));
            }
        }
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].0, PlayerHandle::new(1));
        assert_eq!(received[0].1.frame, Frame::new(0));
        assert_eq!(received[0].1.input.value, 10);
        assert_eq!(received[2].1.input.value, 12);
    }

    #[test]
    fn acks_shrink_the_pending_window() {
        let mut local = endpoint();
        let mut remote = endpoint();
        synchronize_pair(&mut local, &mut remote);

        let statuses = vec![ConnectionStatus::default(); 2];
        for frame in 0..5 {
            let mut inputs = BTreeMap::new();
            inputs.insert(
                PlayerHandle::new(0),
                PlayerInput::new(Frame::new(frame), TestInput::default()),
            );
            local.send_input(&inputs, &statuses);
        }
        assert_eq!(local.pending_output.len(), 5);

        for msg in drain_queued(&mut local) {
            remote.handle_message(&msg);
        }
        for msg in drain_queued(&mut remote) {
            local.handle_message(&msg);
        }
        assert_eq!(local.pending_output.len(), 0);
        assert_eq!(local.last_acked_input.frame, Frame::new(4));
    }

    #[test]
    fn overflowing_pending_window_disconnects() {
        let mut local = endpoint();
        let mut remote = endpoint();
        synchronize_pair(&mut local, &mut remote);

        let statuses = vec![ConnectionStatus::default(); 2];
        let mut disconnected = false;
        for frame in 0..=PENDING_OUTPUT_SIZE as i32 {
            let mut inputs = BTreeMap::new();
            inputs.insert(
                PlayerHandle::new(0),
                PlayerInput::new(Frame::new(frame), TestInput::default()),
            );
            local.send_input(&inputs, &statuses);
            drain_queued(&mut local);
        }
        for event in local.poll(&statuses) {
            if matches!(event, Event::Disconnected) {
                disconnected = true;
            }
        }
        assert!(disconnected);
    }

    #[test]
    fn quality_report_is_answered_and_measures_rtt() {
        let mut local = endpoint();
        let mut remote = endpoint();
        synchronize_pair(&mut local, &mut remote);

        let sent_at = millis_since_epoch();
        remote.handle_message(&Message {
            header: MessageHeader { magic: remote.remote_magic },
            body: MessageBody::QualityReport(QualityReport {
                frame_advantage: 3,
                ping: sent_at,
            }),
        });
        assert_eq!(remote.remote_frame_advantage, 3);
        let replies = drain_queued(&mut remote);
        assert!(replies
            .iter()
            .any(|msg| matches!(msg.body, MessageBody::QualityReply(reply) if reply.pong == sent_at)));
    }

    #[test]
    fn checksum_history_is_bounded() {
        let mut local = endpoint();
        local.desync_detection = DesyncDetection::On { interval: 1 };
        for frame in 0..100 {
            local.on_checksum_report(ChecksumReport {
                checksum: frame as u64,
                frame: Frame::new(frame),
            });
        }
        assert!(local.pending_checksums.len() <= MAX_CHECKSUM_HISTORY_SIZE);
        // the newest reports survive
        assert!(local.pending_checksums.contains_key(&Frame::new(99)));
    }

    #[test]
    fn disconnect_request_raises_event_once() {
        let mut local = endpoint();
        let mut remote = endpoint();
        synchronize_pair(&mut local, &mut remote);

        let body = Input {
            disconnect_requested: true,
            start_frame: Frame::new(0),
            ..Input::default()
        };
        let magic = remote.remote_magic;
        for _ in 0..2 {
            remote.handle_message(&Message {
                header: MessageHeader { magic },
                body: MessageBody::Input(body.clone()),
            });
        }
        let disconnects = remote
            .poll(&[])
            .filter(|event| matches!(event, Event::Disconnected))
            .count();
        assert_eq!(disconnects, 1);
    }
}
