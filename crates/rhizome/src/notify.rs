use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
        };
        formatter.write_str(name)
    }
}

/// An output artifact that differs from the previous build.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} {}", self.kind, self.path.display())
    }
}

/// Receives change events once a build has finished. Delivery is best effort
/// and never reported back to the build.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, events: &[ChangeEvent]);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn notify(&self, _events: &[ChangeEvent]) {}
}

/// Forwards each event over a channel, e.g. to a live-reload loop.
pub struct ChannelNotifier {
    sender: Mutex<Sender<ChangeEvent>>,
}

impl ChannelNotifier {
    pub fn new(sender: Sender<ChangeEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl ChangeNotifier for ChannelNotifier {
    fn notify(&self, events: &[ChangeEvent]) {
        let Ok(sender) = self.sender.lock() else {
            return;
        };
        for event in events {
            if sender.send(event.clone()).is_err() {
                break;
            }
        }
    }
}
