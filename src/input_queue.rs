//! A ring buffer of inputs for a single player, with prediction.
//!
//! The queue holds confirmed inputs and hands out predictions for frames
//! whose real input has not arrived yet. Predictions repeat the most recent
//! confirmed input; once the real input arrives it is compared against the
//! prediction that was handed out, and the first mismatching frame is
//! recorded so the session knows how far to roll back.

use tracing::trace;

use crate::frame_info::PlayerInput;
use crate::{Config, Frame, InputStatus};

/// Number of slots in the ring. Bounds how far confirmed inputs can run
/// ahead of the last discard.
pub(crate) const INPUT_QUEUE_LENGTH: usize = 128;

fn previous_position(head: usize) -> usize {
    if head == 0 {
        INPUT_QUEUE_LENGTH - 1
    } else {
        head - 1
    }
}

/// The input queue for a single player.
#[derive(Debug, Clone)]
pub(crate) struct InputQueue<T>
where
    T: Config,
{
    head: usize,
    tail: usize,
    length: usize,
    first_frame: bool,

    last_added_frame: Frame,
    first_incorrect_frame: Frame,
    last_requested_frame: Frame,

    frame_delay: u32,

    inputs: Vec<PlayerInput<T::Input>>,
    prediction: PlayerInput<T::Input>,
}

impl<T: Config> InputQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: 0,
            tail: 0,
            length: 0,
            first_frame: true,
            last_added_frame: Frame::NULL,
            first_incorrect_frame: Frame::NULL,
            last_requested_frame: Frame::NULL,
            frame_delay: 0,
            inputs: vec![PlayerInput::blank_input(Frame::NULL); INPUT_QUEUE_LENGTH],
            prediction: PlayerInput::blank_input(Frame::NULL),
        }
    }

    pub(crate) fn first_incorrect_frame(&self) -> Frame {
        self.first_incorrect_frame
    }

    pub(crate) fn set_frame_delay(&mut self, delay: u32) {
        self.frame_delay = delay;
    }

    /// Clears all prediction bookkeeping. Called after a rollback has
    /// resolved the mispredicted frames.
    pub(crate) fn reset_prediction(&mut self) {
        self.prediction.frame = Frame::NULL;
        self.first_incorrect_frame = Frame::NULL;
        self.last_requested_frame = Frame::NULL;
    }

    /// Returns the confirmed input for the requested frame, or `None` if it
    /// is not (or no longer) in the queue.
    pub(crate) fn confirmed_input(&self, requested_frame: Frame) -> Option<PlayerInput<T::Input>> {
        let offset = requested_frame.as_i32() as usize % INPUT_QUEUE_LENGTH;
        (self.inputs[offset].frame == requested_frame).then(|| self.inputs[offset])
    }

    /// Drops inputs at or below `frame` from the queue, keeping at least
    /// the most recent one. Frames the session has already requested are
    /// never discarded, since a rollback may still need them.
    pub(crate) fn discard_confirmed_frames(&mut self, mut frame: Frame) {
        if self.last_added_frame.is_null() {
            return;
        }
        if self.last_requested_frame.is_valid() {
            frame = frame.min(self.last_requested_frame);
        }

        if frame >= self.last_added_frame {
            // delete all but the most recent, which sits at head - 1
            self.tail = previous_position(self.head);
            self.length = 1;
        } else if frame <= self.inputs[self.tail].frame {
            // nothing to discard
        } else {
            let offset = (frame - self.inputs[self.tail].frame) as usize;
            self.tail = (self.tail + offset) % INPUT_QUEUE_LENGTH;
            self.length -= offset;
        }
    }

    /// Returns the input to simulate `requested_frame` with, either a
    /// confirmed input or a prediction.
    ///
    /// # Panics
    ///
    /// Panics if a misprediction is still unresolved or if the requested
    /// frame was already discarded; both are session-logic bugs.
    pub(crate) fn input(&mut self, requested_frame: Frame) -> (T::Input, InputStatus) {
        assert!(
            self.first_incorrect_frame.is_null(),
            "tried to simulate before resolving misprediction at frame {}",
            self.first_incorrect_frame
        );
        self.last_requested_frame = requested_frame;
        assert!(
            requested_frame >= self.inputs[self.tail].frame,
            "frame {requested_frame} was already discarded"
        );

        if self.prediction.frame.is_null() {
            let offset = (requested_frame - self.inputs[self.tail].frame) as usize;
            if offset < self.length {
                let offset = (offset + self.tail) % INPUT_QUEUE_LENGTH;
                assert_eq!(self.inputs[offset].frame, requested_frame);
                return (self.inputs[offset].input, InputStatus::Confirmed);
            }

            // seed the prediction: repeat the most recent confirmed input,
            // or a blank one if nothing was ever confirmed
            if requested_frame == Frame::FIRST || self.last_added_frame.is_null() {
                self.prediction = PlayerInput::blank_input(self.prediction.frame);
            } else {
                self.prediction = self.inputs[previous_position(self.head)];
            }
            self.prediction.frame += 1;
        }

        assert!(self.prediction.frame.is_valid());
        trace!(frame = %requested_frame, "handing out predicted input");
        (self.prediction.input, InputStatus::Predicted)
    }

    /// Adds a confirmed input to the queue, applying the local frame delay.
    /// Returns the frame the input actually landed on, or [`Frame::NULL`]
    /// if the input was dropped as out of order or superseded.
    pub(crate) fn add_input(&mut self, input: PlayerInput<T::Input>) -> Frame {
        if self.last_added_frame.is_valid()
            && input.frame + self.frame_delay as i32 != self.last_added_frame + 1
        {
            return Frame::NULL;
        }

        let new_frame = self.advance_queue_head(input.frame);
        if new_frame.is_valid() {
            self.add_input_by_frame(input, new_frame);
        }
        new_frame
    }

    /// Adds an input at exactly `frame` and checks it against any
    /// outstanding prediction for that frame.
    pub(crate) fn add_input_by_frame(&mut self, input: PlayerInput<T::Input>, frame: Frame) {
        let previous_position = previous_position(self.head);
        assert!(self.last_added_frame.is_null() || frame == self.last_added_frame + 1);
        assert!(frame == Frame::FIRST || self.inputs[previous_position].frame == frame - 1);

        self.inputs[self.head] = input;
        self.inputs[self.head].frame = frame;
        self.head = (self.head + 1) % INPUT_QUEUE_LENGTH;
        self.length += 1;
        assert!(self.length <= INPUT_QUEUE_LENGTH, "input queue overflow");
        self.first_frame = false;
        self.last_added_frame = frame;

        if self.prediction.frame.is_valid() {
            assert_eq!(frame, self.prediction.frame);

            // frame numbers differ between the prediction and the confirmed
            // input, so only the input payload is compared
            if self.first_incorrect_frame.is_null() && !self.prediction.equal(&input, true) {
                trace!(frame = %frame, "misprediction detected");
                self.first_incorrect_frame = frame;
            }

            if self.prediction.frame == self.last_requested_frame
                && self.first_incorrect_frame.is_null()
            {
                self.prediction.frame = Frame::NULL;
            } else {
                self.prediction.frame += 1;
            }
        }
    }

    /// Fills any gap between the expected next frame and the (delayed)
    /// incoming frame by repeating the previous input, then returns the
    /// frame the incoming input should land on. Returns [`Frame::NULL`] if
    /// the delayed frame is already in the past.
    fn advance_queue_head(&mut self, input_frame: Frame) -> Frame {
        let mut expected_frame = if self.first_frame {
            Frame::FIRST
        } else {
            self.inputs[previous_position(self.head)].frame + 1
        };
        let input_frame = input_frame + self.frame_delay as i32;

        if expected_frame > input_frame {
            return Frame::NULL;
        }

        while expected_frame < input_frame {
            let input_to_replicate = self.inputs[previous_position(self.head)];
            self.add_input_by_frame(input_to_replicate, expected_frame);
            expected_frame += 1;
        }

        assert!(
            input_frame == Frame::FIRST
                || input_frame == self.inputs[previous_position(self.head)].frame + 1
        );
        input_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ByteReader, DecodeError, Serde};

    #[derive(Copy, Clone, PartialEq, Default, Debug)]
    struct TestInput {
        value: u8,
    }

    impl Serde for TestInput {
        fn serde_size(&self) -> usize {
            1
        }
        fn serialize(&self, out: &mut Vec<u8>) {
            out.push(self.value);
        }
        fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
            Ok(Self { value: r.read_u8()? })
        }
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type State = u32;
        type Address = usize;
    }

    fn input(frame: i32, value: u8) -> PlayerInput<TestInput> {
        PlayerInput::new(Frame::new(frame), TestInput { value })
    }

    #[test]
    fn sequential_inputs_are_confirmed() {
        let mut queue = InputQueue::<TestConfig>::new();
        for frame in 0..5 {
            assert_eq!(queue.add_input(input(frame, frame as u8)), Frame::new(frame));
        }
        for frame in 0..5 {
            let (value, status) = queue.input(Frame::new(frame));
            assert_eq!(value.value, frame as u8);
            assert_eq!(status, InputStatus::Confirmed);
        }
    }

    #[test]
    fn non_contiguous_input_is_dropped() {
        let mut queue = InputQueue::<TestConfig>::new();
        assert_eq!(queue.add_input(input(0, 1)), Frame::new(0));
        assert_eq!(queue.add_input(input(3, 2)), Frame::NULL);
        assert_eq!(queue.add_input(input(0, 2)), Frame::NULL);
        assert_eq!(queue.add_input(input(1, 2)), Frame::new(1));
    }

    #[test]
    fn prediction_repeats_last_confirmed_input() {
        let mut queue = InputQueue::<TestConfig>::new();
        queue.add_input(input(0, 9));
        let (value, status) = queue.input(Frame::new(3));
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(value.value, 9);
    }

    #[test]
    fn first_ever_prediction_is_blank() {
        let mut queue = InputQueue::<TestConfig>::new();
        let (value, status) = queue.input(Frame::new(0));
        assert_eq!(status, InputStatus::Predicted);
        assert_eq!(value, TestInput::default());
    }

    #[test]
    fn correct_prediction_leaves_no_incorrect_frame() {
        let mut queue = InputQueue::<TestConfig>::new();
        queue.add_input(input(0, 5));
        let (value, _) = queue.input(Frame::new(1));
        assert_eq!(value.value, 5);
        queue.add_input(input(1, 5));
        assert!(queue.first_incorrect_frame().is_null());
    }

    #[test]
    fn misprediction_records_first_incorrect_frame() {
        let mut queue = InputQueue::<TestConfig>::new();
        queue.add_input(input(0, 5));
        queue.input(Frame::new(1));
        queue.input(Frame::new(2));
        queue.add_input(input(1, 5));
        queue.add_input(input(2, 6));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(2));
    }

    #[test]
    fn reset_prediction_clears_state() {
        let mut queue = InputQueue::<TestConfig>::new();
        queue.add_input(input(0, 5));
        queue.input(Frame::new(1));
        queue.add_input(input(1, 7));
        assert_eq!(queue.first_incorrect_frame(), Frame::new(1));
        queue.reset_prediction();
        assert!(queue.first_incorrect_frame().is_null());
        let (_, status) = queue.input(Frame::new(0));
        assert_eq!(status, InputStatus::Confirmed);
    }

    #[test]
    fn frame_delay_shifts_inputs_and_fills_gap() {
        let mut queue = InputQueue::<TestConfig>::new();
        queue.set_frame_delay(2);
        assert_eq!(queue.add_input(input(0, 9)), Frame::new(2));
        // frames 0 and 1 were filled with replicated (blank) inputs
        let (value, status) = queue.input(Frame::new(0));
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(value, TestInput::default());
        let (value, status) = queue.input(Frame::new(2));
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(value.value, 9);
    }

    #[test]
    fn discard_keeps_requested_frames() {
        let mut queue = InputQueue::<TestConfig>::new();
        for frame in 0..10 {
            queue.add_input(input(frame, frame as u8));
        }
        queue.input(Frame::new(4));
        // discard is clamped to the last requested frame
        queue.discard_confirmed_frames(Frame::new(8));
        let (value, status) = queue.input(Frame::new(4));
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(value.value, 4);
    }

    #[test]
    fn discard_past_last_added_keeps_most_recent() {
        let mut queue = InputQueue::<TestConfig>::new();
        for frame in 0..5 {
            queue.add_input(input(frame, frame as u8));
        }
        queue.input(Frame::new(4));
        queue.discard_confirmed_frames(Frame::new(100));
        let (value, status) = queue.input(Frame::new(4));
        assert_eq!(status, InputStatus::Confirmed);
        assert_eq!(value.value, 4);
    }

    #[test]
    fn discard_on_empty_queue_is_a_no_op() {
        let mut queue = InputQueue::<TestConfig>::new();
        queue.discard_confirmed_frames(Frame::new(5));
        let (_, status) = queue.input(Frame::new(0));
        assert_eq!(status, InputStatus::Predicted);
    }

    #[test]
    #[should_panic]
    fn requesting_discarded_frame_panics() {
        let mut queue = InputQueue::<TestConfig>::new();
        for frame in 0..10 {
            queue.add_input(input(frame, 0));
        }
        queue.input(Frame::new(9));
        queue.reset_prediction();
        queue.discard_confirmed_frames(Frame::new(5));
        queue.input(Frame::new(2));
    }
}
