use duskswitch_common::DeviceStateEntry;

/// Last known power state of every configured device, in configuration order
#[derive(Debug, Clone, Default)]
pub struct DeviceStateTable {
    entries: Vec<DeviceStateEntry>,
}

impl DeviceStateTable {
    /// One entry per distinct id, all starting off
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries: Vec<DeviceStateEntry> = Vec::new();
        for id in ids {
            let id = id.into();
            if !entries.iter().any(|e| e.id == id) {
                entries.push(DeviceStateEntry { id, state: false });
            }
        }
        Self { entries }
    }

    pub fn get(&self, id: &str) -> Option<bool> {
        self.entries.iter().find(|e| e.id == id).map(|e| e.state)
    }

    /// Record a confirmed state. Returns false for an unknown id.
    pub fn record(&mut self, id: &str, state: bool) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[DeviceStateEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every device is recorded in `state`
    pub fn all(&self, state: bool) -> bool {
        self.entries.iter().all(|e| e.state == state)
    }
}
