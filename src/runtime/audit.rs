use portable_plugin::Meta;

/// Encoded START commands of the symbols a plugin should be running, in the
/// order they were first started.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<(Meta, Vec<u8>)>,
}

impl AuditLog {
    /// Insert, or overwrite in place when `meta` is already present.
    pub fn record(&mut self, meta: Meta, command: Vec<u8>) {
        match self.entries.iter_mut().find(|(key, _)| *key == meta) {
            Some((_, existing)) => *existing = command,
            None => self.entries.push((meta, command)),
        }
    }

    pub fn remove(&mut self, meta: &Meta) -> Option<Vec<u8>> {
        let idx = self.entries.iter().position(|(key, _)| key == meta)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get(&self, meta: &Meta) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(key, _)| key == meta)
            .map(|(_, cmd)| cmd.as_slice())
    }

    pub fn keys(&self) -> Vec<Meta> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn entries(&self) -> &[(Meta, Vec<u8>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
