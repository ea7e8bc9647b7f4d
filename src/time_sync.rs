//! Frame advantage tracking for soft speed synchronization.
//!
//! Each running frame, a peer records how far ahead of the other it is
//! running, locally measured and as reported by the remote. Averaged over a
//! sliding window, half the difference is the number of frames this peer
//! should wait to meet the other in the middle.

use crate::Frame;

const FRAME_WINDOW_SIZE: usize = 30;

#[derive(Debug, Clone)]
pub(crate) struct TimeSync {
    local: [i32; FRAME_WINDOW_SIZE],
    remote: [i32; FRAME_WINDOW_SIZE],
}

impl Default for TimeSync {
    fn default() -> Self {
        Self {
            local: [0; FRAME_WINDOW_SIZE],
            remote: [0; FRAME_WINDOW_SIZE],
        }
    }
}

impl TimeSync {
    pub(crate) fn advance_frame(&mut self, frame: Frame, local_adv: i32, remote_adv: i32) {
        assert!(frame.is_valid());
        let slot = frame.as_i32() as usize % FRAME_WINDOW_SIZE;
        self.local[slot] = local_adv;
        self.remote[slot] = remote_adv;
    }

    /// Half the averaged advantage difference, rounded to the nearest whole
    /// frame. Positive means the local client is ahead and should wait.
    pub(crate) fn average_frame_advantage(&self) -> i32 {
        let local_sum: i32 = self.local.iter().sum();
        let remote_sum: i32 = self.remote.iter().sum();
        let local_avg = f64::from(local_sum) / FRAME_WINDOW_SIZE as f64;
        let remote_avg = f64::from(remote_sum) / FRAME_WINDOW_SIZE as f64;
        ((remote_avg - local_avg) / 2.0).round() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_has_no_advantage() {
        let sync = TimeSync::default();
        assert_eq!(sync.average_frame_advantage(), 0);
    }

    #[test]
    fn balanced_advantages_cancel_out() {
        let mut sync = TimeSync::default();
        for frame in 0..60 {
            sync.advance_frame(Frame::new(frame), 4, 4);
        }
        assert_eq!(sync.average_frame_advantage(), 0);
    }

    #[test]
    fn remote_ahead_yields_positive_advantage() {
        let mut sync = TimeSync::default();
        for frame in 0..30 {
            sync.advance_frame(Frame::new(frame), 0, 8);
        }
        assert_eq!(sync.average_frame_advantage(), 4);
    }

    #[test]
    fn advantage_rounds_to_nearest_frame() {
        let mut sync = TimeSync::default();
        // remote average 1, local 0, half difference 0.5 rounds up
        for frame in 0..30 {
            sync.advance_frame(Frame::new(frame), 0, 1);
        }
        assert_eq!(sync.average_frame_advantage(), 1);
    }

    #[test]
    fn window_overwrites_old_slots() {
        let mut sync = TimeSync::default();
        for frame in 0..30 {
            sync.advance_frame(Frame::new(frame), 0, 100);
        }
        for frame in 30..60 {
            sync.advance_frame(Frame::new(frame), 0, 2);
        }
        assert_eq!(sync.average_frame_advantage(), 1);
    }

    #[test]
    #[should_panic]
    fn null_frame_is_rejected() {
        let mut sync = TimeSync::default();
        sync.advance_frame(Frame::NULL, 0, 0);
    }
}
