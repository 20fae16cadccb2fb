use crate::metadata::Occurrence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Idle,
    Tracking { start_frame: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEvent {
    SubjectSeen(u64),
    SubjectNotSeen(u64),
    EndOfStream(u64),
}

/// 跟踪目标的出现区间状态机
///
/// 只在检测帧上输入事件：第一次命中时打开区间，第一次未命中时关闭；
/// 区间内的重复命中不会拆分区间。
#[derive(Debug, Clone)]
pub struct SubjectTracker {
    state: TrackState,
    occurrences: Vec<Occurrence>,
}

impl Default for SubjectTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SubjectTracker {
    pub fn new() -> Self {
        Self {
            state: TrackState::Idle,
            occurrences: Vec::new(),
        }
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    /// 处理一个事件，若关闭了一个区间则返回该区间
    pub fn handle(&mut self, event: TrackEvent) -> Option<Occurrence> {
        let (next, closed) = match (self.state, event) {
            (TrackState::Idle, TrackEvent::SubjectSeen(frame)) => (TrackState::Tracking { start_frame: frame }, None),
            (TrackState::Idle, _) => (TrackState::Idle, None),
            (state @ TrackState::Tracking { .. }, TrackEvent::SubjectSeen(_)) => (state, None),
            (TrackState::Tracking { start_frame }, TrackEvent::SubjectNotSeen(frame))
            | (TrackState::Tracking { start_frame }, TrackEvent::EndOfStream(frame)) => (
                TrackState::Idle,
                Some(Occurrence {
                    start_frame,
                    end_frame: frame.max(start_frame),
                }),
            ),
        };

        self.state = next;
        if let Some(occurrence) = closed {
            self.occurrences.push(occurrence);
        }
        closed
    }

    pub fn occurrences(&self) -> &[Occurrence] {
        &self.occurrences
    }

    pub fn into_occurrences(self) -> Vec<Occurrence> {
        self.occurrences
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TrackEvent::*;

    #[test]
    fn test_open_and_close() {
        let mut tracker = SubjectTracker::new();
        assert_eq!(tracker.handle(SubjectNotSeen(0)), None);
        assert_eq!(tracker.handle(SubjectSeen(10)), None);
        assert_eq!(tracker.state(), TrackState::Tracking { start_frame: 10 });
        assert_eq!(tracker.handle(SubjectSeen(20)), None);
        assert_eq!(
            tracker.handle(SubjectNotSeen(30)),
            Some(Occurrence {
                start_frame: 10,
                end_frame: 30
            })
        );
        assert_eq!(tracker.state(), TrackState::Idle);
    }

    #[test]
    fn test_end_of_stream_closes_open_occurrence() {
        let mut tracker = SubjectTracker::new();
        tracker.handle(SubjectSeen(40));
        tracker.handle(SubjectNotSeen(50));
        tracker.handle(SubjectSeen(70));
        tracker.handle(EndOfStream(95));
        assert_eq!(
            tracker.into_occurrences(),
            vec![
                Occurrence {
                    start_frame: 40,
                    end_frame: 50
                },
                Occurrence {
                    start_frame: 70,
                    end_frame: 95
                },
            ]
        );
    }

    #[test]
    fn test_end_of_stream_when_idle() {
        let mut tracker = SubjectTracker::new();
        assert_eq!(tracker.handle(EndOfStream(100)), None);
        assert!(tracker.occurrences().is_empty());
    }
}
