//! A fluent builder to configure and start sessions.

use std::collections::BTreeMap;

use web_time::Duration;

use crate::network::protocol::UdpProtocol;
use crate::sessions::p2p_session::PlayerRegistry;
use crate::sessions::spectator_session::SPECTATOR_BUFFER_SIZE;
use crate::{
    Config, DesyncDetection, FramelockError, NonBlockingSocket, P2PSession, PlayerHandle,
    PlayerType, SpectatorSession, SyncTestSession, MAX_NUM_PLAYERS,
};

const DEFAULT_PLAYERS: usize = 2;
const DEFAULT_MAX_PREDICTION_FRAMES: usize = 8;
const DEFAULT_FPS: u32 = 60;
const DEFAULT_SPARSE_SAVING: bool = false;
const DEFAULT_DESYNC_DETECTION: DesyncDetection = DesyncDetection::Off;
const DEFAULT_INPUT_DELAY: u32 = 0;
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
const DEFAULT_DISCONNECT_NOTIFY_START: Duration = Duration::from_millis(500);
const DEFAULT_CHECK_DISTANCE: usize = 2;
const DEFAULT_MAX_FRAMES_BEHIND: usize = 10;
const DEFAULT_CATCHUP_SPEED: usize = 1;

/// The [`SessionBuilder`] builds all sessions. Add players and adjust
/// settings, then consume the builder with one of the `start_*_session`
/// methods.
///
/// ```no_run
/// # use framelock::{Config, SessionBuilder, PlayerHandle, PlayerType, UdpNonBlockingSocket};
/// # use framelock::{ByteReader, DecodeError, Serde};
/// # #[derive(Copy, Clone, PartialEq, Default)]
/// # struct Input(u8);
/// # impl Serde for Input {
/// #     fn serde_size(&self) -> usize { 1 }
/// #     fn serialize(&self, out: &mut Vec<u8>) { self.0.serialize(out); }
/// #     fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
/// #         Ok(Self(r.read_u8()?))
/// #     }
/// # }
/// # struct GameConfig;
/// # impl Config for GameConfig {
/// #     type Input = Input;
/// #     type State = u8;
/// #     type Address = std::net::SocketAddr;
/// # }
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let remote_addr: std::net::SocketAddr = "127.0.0.1:7001".parse()?;
/// let socket = UdpNonBlockingSocket::bind_to_port(7000)?;
/// let mut session = SessionBuilder::<GameConfig>::new()
///     .with_num_players(2)?
///     .with_input_delay(1)
///     .add_player(PlayerType::Local, PlayerHandle::new(0))?
///     .add_player(PlayerType::Remote(remote_addr), PlayerHandle::new(1))?
///     .start_p2p_session(socket)?;
/// # Ok(())
/// # }
/// ```
#[must_use = "the builder does nothing until a start_*_session method consumes it"]
pub struct SessionBuilder<T>
where
    T: Config,
{
    num_players: usize,
    local_players: usize,
    max_prediction: usize,
    fps: u32,
    sparse_saving: bool,
    desync_detection: DesyncDetection,
    disconnect_timeout: Duration,
    disconnect_notify_start: Duration,
    handles: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
    input_delay: u32,
    check_distance: usize,
    max_frames_behind: usize,
    catchup_speed: usize,
}

impl<T: Config> Default for SessionBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Config> SessionBuilder<T> {
    /// Creates a builder with default settings: 2 players, a prediction
    /// window of 8 frames, 60 fps, no input delay, sparse saving and desync
    /// detection off.
    pub fn new() -> Self {
        Self {
            num_players: DEFAULT_PLAYERS,
            local_players: 0,
            max_prediction: DEFAULT_MAX_PREDICTION_FRAMES,
            fps: DEFAULT_FPS,
            sparse_saving: DEFAULT_SPARSE_SAVING,
            desync_detection: DEFAULT_DESYNC_DETECTION,
            disconnect_timeout: DEFAULT_DISCONNECT_TIMEOUT,
            disconnect_notify_start: DEFAULT_DISCONNECT_NOTIFY_START,
            handles: BTreeMap::new(),
            input_delay: DEFAULT_INPUT_DELAY,
            check_distance: DEFAULT_CHECK_DISTANCE,
            max_frames_behind: DEFAULT_MAX_FRAMES_BEHIND,
            catchup_speed: DEFAULT_CATCHUP_SPEED,
        }
    }

    /// Registers a player or spectator under the given handle. Active
    /// players take handles `0..num_players`, spectators any handle at or
    /// above `num_players`.
    ///
    /// # Errors
    /// Returns [`InvalidRequest`](FramelockError::InvalidRequest) if the
    /// handle is already in use or outside the valid range for the player
    /// type.
    pub fn add_player(
        mut self,
        player_type: PlayerType<T::Address>,
        player_handle: PlayerHandle,
    ) -> Result<Self, FramelockError> {
        if self.handles.contains_key(&player_handle) {
            return Err(FramelockError::InvalidRequest {
                info: format!("player handle {player_handle} already in use"),
            });
        }
        match player_type {
            PlayerType::Local | PlayerType::Remote(_) => {
                if player_handle.as_usize() >= self.num_players {
                    return Err(FramelockError::InvalidRequest {
                        info: format!(
                            "player handle {player_handle} invalid: valid handles are 0 to {}",
                            self.num_players - 1
                        ),
                    });
                }
                if matches!(player_type, PlayerType::Local) {
                    self.local_players += 1;
                }
            }
            PlayerType::Spectator(_) => {
                if player_handle.as_usize() < self.num_players {
                    return Err(FramelockError::InvalidRequest {
                        info: format!(
                            "spectator handle {player_handle} invalid: must be at least {}",
                            self.num_players
                        ),
                    });
                }
            }
        }
        self.handles.insert(player_handle, player_type);
        Ok(self)
    }

    /// Sets the number of active (non-spectator) players.
    ///
    /// # Errors
    /// Returns [`InvalidRequest`](FramelockError::InvalidRequest) for more
    /// than [`MAX_NUM_PLAYERS`] players.
    pub fn with_num_players(mut self, num_players: usize) -> Result<Self, FramelockError> {
        if num_players > MAX_NUM_PLAYERS {
            return Err(FramelockError::InvalidRequest {
                info: format!("num players {num_players} exceeds the maximum of {MAX_NUM_PLAYERS}"),
            });
        }
        self.num_players = num_players;
        Ok(self)
    }

    /// Sets the maximum number of frames the session predicts ahead of
    /// confirmed inputs. 0 makes the session run in lockstep.
    pub fn with_max_prediction_window(mut self, window: usize) -> Self {
        self.max_prediction = window;
        self
    }

    /// Sets the number of frames local inputs are delayed before taking
    /// effect. Delay trades responsiveness for fewer rollbacks.
    pub fn with_input_delay(mut self, delay: u32) -> Self {
        self.input_delay = delay;
        self
    }

    /// With sparse saving, the session only saves the last confirmed frame
    /// instead of every frame inside the prediction window, trading longer
    /// resimulations for fewer saves.
    pub fn with_sparse_saving_mode(mut self, sparse_saving: bool) -> Self {
        self.sparse_saving = sparse_saving;
        self
    }

    /// Enables or disables desync detection through periodic checksum
    /// exchange with remote clients.
    pub fn with_desync_detection_mode(mut self, desync_detection: DesyncDetection) -> Self {
        self.desync_detection = desync_detection;
        self
    }

    /// Sets how long remotes may stay silent before being disconnected.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Sets how long remotes may stay silent before a
    /// [`NetworkInterrupted`](crate::FramelockEvent::NetworkInterrupted)
    /// event is emitted.
    pub fn with_disconnect_notify_delay(mut self, notify_delay: Duration) -> Self {
        self.disconnect_notify_start = notify_delay;
        self
    }

    /// Sets the expected update frequency of the session, used to estimate
    /// frame advantages over the network.
    ///
    /// # Errors
    /// Returns [`InvalidRequest`](FramelockError::InvalidRequest) for an
    /// fps of 0.
    pub fn with_fps(mut self, fps: u32) -> Result<Self, FramelockError> {
        if fps == 0 {
            return Err(FramelockError::InvalidRequest {
                info: "fps must be higher than 0".to_owned(),
            });
        }
        self.fps = fps;
        Ok(self)
    }

    /// Sets how many frames a [`SyncTestSession`] resimulates and verifies
    /// every tick.
    pub fn with_check_distance(mut self, check_distance: usize) -> Self {
        self.check_distance = check_distance;
        self
    }

    /// Sets how many frames a spectator may lag behind the host before it
    /// starts catching up.
    ///
    /// # Errors
    /// Returns [`InvalidRequest`](FramelockError::InvalidRequest) if the
    /// value is 0 or does not fit the spectator input buffer.
    pub fn with_max_frames_behind(mut self, max_frames_behind: usize) -> Result<Self, FramelockError> {
        if max_frames_behind < 1 {
            return Err(FramelockError::InvalidRequest {
                info: "max frames behind cannot be smaller than 1".to_owned(),
            });
        }
        if max_frames_behind >= SPECTATOR_BUFFER_SIZE {
            return Err(FramelockError::InvalidRequest {
                info: "max frames behind cannot be larger than the spectator buffer size".to_owned(),
            });
        }
        self.max_frames_behind = max_frames_behind;
        Ok(self)
    }

    /// Sets how many frames a spectator advances per tick while catching
    /// up.
    ///
    /// # Errors
    /// Returns [`InvalidRequest`](FramelockError::InvalidRequest) if the
    /// speed is 0 or not smaller than the allowed frames behind.
    pub fn with_catchup_speed(mut self, catchup_speed: usize) -> Result<Self, FramelockError> {
        if catchup_speed < 1 {
            return Err(FramelockError::InvalidRequest {
                info: "catchup speed cannot be smaller than 1".to_owned(),
            });
        }
        if catchup_speed >= self.max_frames_behind {
            return Err(FramelockError::InvalidRequest {
                info: "catchup speed must be smaller than the allowed max frames behind".to_owned(),
            });
        }
        self.catchup_speed = catchup_speed;
        Ok(self)
    }

    /// Consumes the builder and starts a [`P2PSession`] communicating over
    /// the given socket.
    ///
    /// # Errors
    /// Returns [`InvalidRequest`](FramelockError::InvalidRequest) if not
    /// every player handle in `0..num_players` has been registered.
    pub fn start_p2p_session(
        self,
        socket: impl NonBlockingSocket<T::Address> + 'static,
    ) -> Result<P2PSession<T>, FramelockError> {
        for i in 0..self.num_players {
            if !self.handles.contains_key(&PlayerHandle::new(i)) {
                return Err(FramelockError::InvalidRequest {
                    info: format!("no player added for handle {i}"),
                });
            }
        }

        // all handles sharing an address are served by a single endpoint
        let mut remote_handles: BTreeMap<T::Address, Vec<PlayerHandle>> = BTreeMap::new();
        let mut spectator_handles: BTreeMap<T::Address, Vec<PlayerHandle>> = BTreeMap::new();
        for (&handle, player_type) in &self.handles {
            match player_type {
                PlayerType::Local => (),
                PlayerType::Remote(addr) => {
                    remote_handles.entry(addr.clone()).or_default().push(handle);
                }
                PlayerType::Spectator(addr) => {
                    spectator_handles.entry(addr.clone()).or_default().push(handle);
                }
            }
        }

        let mut registry = PlayerRegistry::new();
        registry.handles = self.handles.clone();
        for (addr, handles) in remote_handles {
            let endpoint = self.create_endpoint(handles, addr.clone(), self.local_players);
            registry.remotes.insert(addr, endpoint);
        }
        for (addr, handles) in spectator_handles {
            let endpoint = self.create_endpoint(handles, addr.clone(), self.num_players);
            registry.spectators.insert(addr, endpoint);
        }

        Ok(P2PSession::new(
            self.num_players,
            self.max_prediction,
            Box::new(socket),
            registry,
            self.sparse_saving,
            self.desync_detection,
            self.input_delay,
        ))
    }

    /// Consumes the builder and starts a [`SpectatorSession`] receiving
    /// inputs from the host at `host_addr` over the given socket.
    pub fn start_spectator_session(
        self,
        host_addr: T::Address,
        socket: impl NonBlockingSocket<T::Address> + 'static,
    ) -> SpectatorSession<T> {
        let handles = (0..self.num_players).map(PlayerHandle::new).collect();
        let host = UdpProtocol::new(
            handles,
            host_addr,
            self.num_players,
            1,
            self.max_prediction,
            self.disconnect_timeout,
            self.disconnect_notify_start,
            self.fps,
            DesyncDetection::Off,
        );
        SpectatorSession::new(
            self.num_players,
            Box::new(socket),
            host,
            self.max_frames_behind,
            self.catchup_speed,
        )
    }

    /// Consumes the builder and starts a [`SyncTestSession`].
    ///
    /// # Errors
    /// Returns [`InvalidRequest`](FramelockError::InvalidRequest) if the
    /// check distance does not fit inside the prediction window.
    pub fn start_synctest_session(self) -> Result<SyncTestSession<T>, FramelockError> {
        if self.check_distance >= self.max_prediction {
            return Err(FramelockError::InvalidRequest {
                info: format!(
                    "check distance {} must be smaller than the prediction window {}",
                    self.check_distance, self.max_prediction
                ),
            });
        }
        Ok(SyncTestSession::new(
            self.num_players,
            self.max_prediction,
            self.check_distance,
            self.input_delay,
        ))
    }

    fn create_endpoint(
        &self,
        handles: Vec<PlayerHandle>,
        peer_addr: T::Address,
        local_players: usize,
    ) -> UdpProtocol<T> {
        UdpProtocol::new(
            handles,
            peer_addr,
            self.num_players,
            local_players,
            self.max_prediction,
            self.disconnect_timeout,
            self.disconnect_notify_start,
            self.fps,
            self.desync_detection,
        )
    }
}
