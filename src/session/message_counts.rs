#[derive(Debug, Default)]
pub struct MessageCounts {
    received: u64,
    sent: u64,
    prefixes_received: u64,
    prefixes_withdrawn: u64,
}

impl MessageCounts {
    pub fn new() -> Self {
        MessageCounts::default()
    }

    pub fn received(&self) -> u64 {
        self.received
    }
    pub fn increment_received(&mut self) {
        self.received += 1;
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
    pub fn increment_sent(&mut self) {
        self.sent += 1;
    }

    pub fn prefixes_received(&self) -> u64 {
        self.prefixes_received
    }
    pub fn add_prefixes_received(&mut self, count: u64) {
        self.prefixes_received += count;
    }

    pub fn prefixes_withdrawn(&self) -> u64 {
        self.prefixes_withdrawn
    }
    pub fn add_prefixes_withdrawn(&mut self, count: u64) {
        self.prefixes_withdrawn += count;
    }
}
