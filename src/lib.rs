//! # Framelock
//!
//! Framelock is a peer-to-peer rollback networking library for real-time
//! deterministic simulations, written in 100% safe Rust.
//!
//! Peers speculatively execute frames with predicted remote input, detect
//! mispredictions once the real input arrives, and resimulate from the last
//! correct point. Instead of registering callback functions, a session
//! returns a list of [`FramelockRequest`]s for the user to fulfill: saving,
//! loading and advancing the game state stays entirely in the caller's
//! hands, so the library never dictates how your game state is represented.
//!
//! The library assumes a raw, unreliable, unordered datagram transport (see
//! [`NonBlockingSocket`]) and implements its own redundancy and ack scheme
//! on top. Encryption, NAT traversal and reliable-ordered delivery are out
//! of scope.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{fmt::Debug, hash::Hash};

pub use error::FramelockError;
pub use network::messages::Message;
pub use network::network_stats::NetworkStats;
pub use network::udp_socket::UdpNonBlockingSocket;
pub use sessions::builder::SessionBuilder;
pub use sessions::p2p_session::P2PSession;
pub use sessions::spectator_session::SpectatorSession;
pub use sessions::sync_test_session::SyncTestSession;
pub use sync_layer::GameStateCell;
pub use wire::{ByteReader, DecodeError, Serde};

#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
#[doc(hidden)]
pub mod input_queue;
#[doc(hidden)]
pub mod rng;
#[doc(hidden)]
pub mod sync_layer;
#[doc(hidden)]
pub mod time_sync;
/// The binary serialization contract every wire and state type implements.
pub mod wire;
#[doc(hidden)]
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    #[doc(hidden)]
    pub mod p2p_session;
    #[doc(hidden)]
    pub mod spectator_session;
    #[doc(hidden)]
    pub mod sync_test_session;
}
#[doc(hidden)]
pub mod network {
    #[doc(hidden)]
    pub mod compression;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod network_stats;
    #[doc(hidden)]
    pub mod protocol;
    #[doc(hidden)]
    pub mod udp_socket;
}

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// The maximum number of players in a single session.
///
/// This cap is enforced when decoding wire messages: a peer claiming more
/// connection statuses than this is treated as a malformed packet.
pub const MAX_NUM_PLAYERS: usize = 16;

/// The maximum size in bytes of the compressed input payload of a single
/// input message. Enforced on decode.
pub const MAX_INPUT_PAYLOAD: usize = 400;

/// The maximum number of session events buffered before the oldest are
/// silently discarded.
pub const MAX_EVENT_QUEUE_SIZE: usize = 100;

/// A frame is a single step of game execution.
///
/// Frames are the fundamental unit of time in rollback networking. Frame
/// numbers start at 0 and increment by exactly one per advanced simulation
/// step. The special value [`Frame::NULL`] (-1) represents "no frame" or
/// "uninitialized".
///
/// # Examples
///
/// ```
/// use framelock::Frame;
///
/// let frame = Frame::FIRST;
/// assert!(frame.is_valid());
/// assert_eq!((frame + 1) - frame, 1);
/// assert!(Frame::NULL.is_null());
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame" or "uninitialized".
    pub const NULL: Frame = Frame(NULL_FRAME);

    /// The first frame of a simulation.
    pub const FIRST: Frame = Frame(0);

    /// The largest representable frame.
    pub const MAX: Frame = Frame(i32::MAX);

    /// Creates a new `Frame` from an `i32` value. This does not validate
    /// the frame number; use [`Frame::is_valid`] to check for
    /// non-negativity.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Frame(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl Default for Frame {
    fn default() -> Self {
        Frame::NULL
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Frame(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Frame;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Frame(self.0 - rhs)
    }
}

impl std::ops::Sub<Frame> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Frame) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Frame(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// A unique identifier for a player or spectator in a session.
///
/// Handles `0` through `num_players - 1` are reserved for active players;
/// handles `num_players` and above identify spectators.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a new `PlayerHandle` from a `usize` value.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        PlayerHandle(handle)
    }

    /// Returns the underlying `usize` value.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(value: usize) -> Self {
        PlayerHandle(value)
    }
}

// #############
// #   ENUMS   #
// #############

/// Desync detection by comparing checksums between peers.
///
/// This is diagnostic only: a detected desync is reported as an event and
/// never auto-corrected. Recovery policy is left to the embedding
/// application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DesyncDetection {
    /// Desync detection is turned on with the given interval rate, in
    /// frames. E.g. at 60 fps an interval of 10 results in 6 reports a
    /// second.
    On {
        /// Number of frames between checksum reports.
        interval: u32,
    },
    /// Desync detection is turned off.
    Off,
}

/// The three kinds of participants a session considers: local players,
/// remote players and spectators. Remote players and spectators carry the
/// peer address they are reachable at.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum PlayerType<A>
where
    A: Clone + PartialEq + Eq + PartialOrd + Ord + Hash,
{
    /// This player plays on the local device.
    Local,
    /// This player plays on a remote device identified by the address.
    Remote(A),
    /// This participant spectates from a remote device identified by the
    /// address. Spectators do not contribute to the game input.
    Spectator(A),
}

/// A session is always in one of these states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The session is attempting to establish a connection to the remote
    /// clients.
    Synchronizing,
    /// The session has synchronized and is ready to take and transmit
    /// player input.
    Running,
}

/// The inputs and input statuses of all players for a single frame, in
/// player handle order. Stored inline for up to four players.
pub type InputVec<I> = smallvec::SmallVec<[(I, InputStatus); 4]>;

/// [`InputStatus`] is given together with every player input when the
/// session requests a frame advance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputStatus {
    /// The input of this player for this frame is an actual received input.
    Confirmed,
    /// The input of this player for this frame is predicted.
    Predicted,
    /// The player has disconnected at or prior to this frame; the given
    /// input is a blank dummy.
    Disconnected,
}

/// Notifications that you can receive from a session. Handling them is up
/// to the user; typically [`WaitRecommendation`] is surfaced as a visible
/// "catching up" stall and the connection events as connection-lost UI.
///
/// [`WaitRecommendation`]: FramelockEvent::WaitRecommendation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramelockEvent<T>
where
    T: Config,
{
    /// The session made progress synchronizing with the given endpoint.
    /// After `total` roundtrips, the endpoints are synchronized.
    Synchronizing {
        /// The address of the endpoint.
        addr: T::Address,
        /// Total number of required successful synchronization roundtrips.
        total: u32,
        /// Current number of successful synchronization roundtrips.
        count: u32,
    },
    /// The session is now synchronized with the given remote client.
    Synchronized {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// The remote client has disconnected.
    Disconnected {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// The session has not received packets from the remote client for some
    /// time and will disconnect it in `disconnect_timeout` ms.
    NetworkInterrupted {
        /// The address of the endpoint.
        addr: T::Address,
        /// The client will be disconnected in this amount of ms.
        disconnect_timeout: u64,
    },
    /// Sent after a [`NetworkInterrupted`] event, if communication with
    /// that client resumed.
    ///
    /// [`NetworkInterrupted`]: FramelockEvent::NetworkInterrupted
    NetworkResumed {
        /// The address of the endpoint.
        addr: T::Address,
    },
    /// The session recommends skipping a few frames to let clients catch
    /// up.
    WaitRecommendation {
        /// Amount of frames to skip in order to let other clients catch up.
        skip_frames: u32,
    },
    /// A discrepancy between local and remote checksums was detected for a
    /// confirmed frame.
    DesyncDetected {
        /// Frame of the mismatched checksums.
        frame: Frame,
        /// Local checksum for the given frame.
        local_checksum: u64,
        /// Remote checksum for the given frame.
        remote_checksum: u64,
        /// Remote address of the endpoint that reported the checksum.
        addr: T::Address,
    },
}

/// Requests that you receive from a session's `advance_frame`. Handling
/// them is mandatory, **in the exact order they are returned**: later
/// requests assume that earlier ones have already been applied to your game
/// state.
pub enum FramelockRequest<T>
where
    T: Config,
{
    /// You should save your current game state into the `cell` provided to
    /// you, together with a checksum of it. The given `frame` is a sanity
    /// check: the state you save should be from exactly that frame.
    SaveGameState {
        /// Use `cell.save(...)` to save your state.
        cell: GameStateCell<T::State>,
        /// The frame the saved state should belong to.
        frame: Frame,
    },
    /// You should load the game state from the `cell` provided to you and
    /// replace your current state with it.
    LoadGameState {
        /// Use `cell.load()` to retrieve the state.
        cell: GameStateCell<T::State>,
        /// The frame the loaded state belongs to.
        frame: Frame,
    },
    /// You should advance your game state with the `inputs` provided to
    /// you.
    AdvanceFrame {
        /// Inputs and input status for each player, ordered by player
        /// handle.
        inputs: InputVec<T::Input>,
    },
}

impl<T: Config> Debug for FramelockRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramelockRequest::SaveGameState { frame, .. } => f
                .debug_struct("SaveGameState")
                .field("frame", frame)
                .finish_non_exhaustive(),
            FramelockRequest::LoadGameState { frame, .. } => f
                .debug_struct("LoadGameState")
                .field("frame", frame)
                .finish_non_exhaustive(),
            FramelockRequest::AdvanceFrame { inputs } => f
                .debug_struct("AdvanceFrame")
                .field("num_inputs", &inputs.len())
                .finish(),
        }
    }
}

// #############
// #  TRAITS   #
// #############

/// Compile time parameterization for sessions.
///
/// This trait bundles the generic types needed for a session. Implement it
/// on a marker struct to configure your session types.
///
/// # Example
///
/// ```
/// use framelock::{ByteReader, Config, DecodeError, Serde};
/// use std::net::SocketAddr;
///
/// #[derive(Copy, Clone, PartialEq, Default)]
/// struct GameInput {
///     buttons: u16,
/// }
///
/// impl Serde for GameInput {
///     fn serde_size(&self) -> usize {
///         2
///     }
///     fn serialize(&self, out: &mut Vec<u8>) {
///         self.buttons.serialize(out);
///     }
///     fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
///         Ok(Self { buttons: u16::deserialize(r)? })
///     }
/// }
///
/// #[derive(Default)]
/// struct GameState {
///     score: u32,
/// }
///
/// impl Serde for GameState {
///     fn serde_size(&self) -> usize {
///         4
///     }
///     fn serialize(&self, out: &mut Vec<u8>) {
///         self.score.serialize(out);
///     }
///     fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
///         Ok(Self { score: u32::deserialize(r)? })
///     }
/// }
///
/// struct GameConfig;
///
/// impl Config for GameConfig {
///     type Input = GameInput;
///     type State = GameState;
///     type Address = SocketAddr;
/// }
/// ```
pub trait Config: 'static {
    /// The input type for a session. This is the only game-related data
    /// transmitted over the network.
    ///
    /// The [`Default`] value represents "no input" and is also used for
    /// disconnected players. Its [`Serde::serde_size`] must equal the
    /// encoded size of every real value (see the [`Serde`] contract).
    type Input: Copy + Clone + PartialEq + Default + Serde;

    /// The save state type for the session. Serialized snapshots of it are
    /// kept in the session's save state ring.
    type State: Serde;

    /// The address type which identifies remote clients.
    type Address: Clone + PartialEq + Eq + PartialOrd + Ord + Hash + Debug;
}

/// The transport abstraction sessions use to reach their peers.
///
/// Messages should be sent in a UDP-like fashion: unordered and unreliable.
/// Framelock implements its own protocol on top to make sure all important
/// information arrives. Both methods must be non-blocking; the protocol
/// polls, it never awaits.
pub trait NonBlockingSocket<A>
where
    A: Clone + PartialEq + Eq + Hash,
{
    /// Takes a [`Message`] and sends it to the given address.
    fn send_to(&mut self, msg: &Message, addr: &A);

    /// Returns all messages received since the last time this method was
    /// called. The pairs `(A, Message)` indicate from which address each
    /// packet was received.
    fn receive_all_messages(&mut self) -> Vec<(A, Message)>;
}
