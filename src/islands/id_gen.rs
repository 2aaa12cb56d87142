/// Monotonic, prefixed id source for islands.
///
/// The first id is `"{prefix}1"`. Ids are never reused for the lifetime of
/// the generator.
#[derive(Debug, Clone)]
pub struct SequentialIdGenerator {
    prefix: String,
    current: u64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            current: 0,
        }
    }

    pub fn next_id(&mut self) -> String {
        self.current += 1;
        format!("{}{}", self.prefix, self.current)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_increment() {
        let mut ids = SequentialIdGenerator::new("I");
        assert_eq!(ids.next_id(), "I1");
        assert_eq!(ids.next_id(), "I2");
        assert_eq!(ids.next_id(), "I3");
    }

    #[test]
    fn empty_prefix() {
        let mut ids = SequentialIdGenerator::new("");
        assert_eq!(ids.next_id(), "1");
        assert_eq!(ids.prefix(), "");
    }
}
