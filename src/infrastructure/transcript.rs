use crate::infrastructure::error::InfraError;
use std::sync::Mutex;

/// Running transcript of the item currently being discussed.
pub trait TranscriptSource: Send + Sync {
    fn append(&self, text: &str) -> Result<(), InfraError>;
    fn snapshot(&self) -> Result<String, InfraError>;
    /// Returns the current text and clears it for the next item.
    fn take(&self) -> Result<String, InfraError>;
}

#[derive(Debug, Default)]
pub struct InMemoryTranscript {
    text: Mutex<String>,
}

impl InMemoryTranscript {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, String>, InfraError> {
        self.text
            .lock()
            .map_err(|error| InfraError::LockPoisoned(format!("transcript lock poisoned: {error}")))
    }
}

impl TranscriptSource for InMemoryTranscript {
    fn append(&self, text: &str) -> Result<(), InfraError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let mut current = self.lock()?;
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(text);
        Ok(())
    }

    fn snapshot(&self) -> Result<String, InfraError> {
        Ok(self.lock()?.clone())
    }

    fn take(&self) -> Result<String, InfraError> {
        Ok(std::mem::take(&mut *self.lock()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_joins_fragments_with_spaces() {
        let transcript = InMemoryTranscript::default();
        transcript.append(" we should ").expect("append");
        transcript.append("").expect("append");
        transcript.append("ship on friday").expect("append");
        assert_eq!(transcript.snapshot().expect("snapshot"), "we should ship on friday");
    }

    #[test]
    fn take_clears_for_next_item() {
        let transcript = InMemoryTranscript::default();
        transcript.append("first item talk").expect("append");
        assert_eq!(transcript.take().expect("take"), "first item talk");
        assert_eq!(transcript.snapshot().expect("snapshot"), "");
        assert_eq!(transcript.take().expect("take"), "");
    }
}
