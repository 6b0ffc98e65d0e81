/// Stage a scan worker is in, used to color progress bars
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusKind {
    #[default]
    Moving,
    Acquiring,
    Done,
    Failed,
}

/// Progress message sent from a scan worker to the GUI or CLI
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanStatus {
    pub progress: f32,
    pub position: usize,
    pub total: usize,
    pub kind: StatusKind,
}

impl ScanStatus {
    pub fn new(position: usize, total: usize, kind: StatusKind) -> Self {
        let progress = if total == 0 {
            1.0
        } else {
            position as f32 / total as f32
        };
        Self {
            progress,
            position,
            total,
            kind,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.kind, StatusKind::Done | StatusKind::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress() {
        let status = ScanStatus::new(3, 12, StatusKind::Acquiring);
        assert_eq!(status.progress, 0.25);
        assert!(!status.is_finished());
        assert_eq!(ScanStatus::new(0, 0, StatusKind::Done).progress, 1.0);
    }
}
