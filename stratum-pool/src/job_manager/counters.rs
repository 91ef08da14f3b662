//! Identifier counters handed out by the job manager.

/// Issues a unique extranonce1 per subscription.
///
/// The instance id occupies the top five bits so that several pool
/// processes sharing one node hand out disjoint ranges.
#[derive(Debug)]
pub struct ExtranonceCounter {
    counter: u32,
}

impl ExtranonceCounter {
    /// Size of an extranonce1 in bytes.
    pub const SIZE: usize = 4;

    pub fn new(instance_id: u32) -> Self {
        Self {
            counter: instance_id << 27,
        }
    }

    /// Next extranonce1 as 8 hex characters.
    pub fn next(&mut self) -> String {
        let value = self.counter;
        self.counter = self.counter.wrapping_add(1);
        hex::encode(value.to_be_bytes())
    }
}

/// Generates job ids.
///
/// Ids are lowercase hex and never a multiple of `0xffff`; the counter
/// cycles back to 1 instead.
#[derive(Debug, Default)]
pub struct JobCounter {
    counter: u32,
}

impl JobCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> String {
        self.counter += 1;
        if self.counter % 0xffff == 0 {
            self.counter = 1;
        }
        format!("{:x}", self.counter)
    }
}

/// Random instance id for when none is configured.
pub fn random_instance_id() -> u32 {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extranonce_counter() {
        let mut counter = ExtranonceCounter::new(0);
        assert_eq!(counter.next(), "00000000");
        assert_eq!(counter.next(), "00000001");

        let mut counter = ExtranonceCounter::new(3);
        assert_eq!(counter.next(), "18000000");
        assert_eq!(counter.next(), "18000001");
    }

    #[test]
    fn test_extranonce_instance_id_overflow() {
        // Only the low five bits of the instance id survive the shift
        let mut counter = ExtranonceCounter::new(0xffff_ffff);
        assert_eq!(counter.next(), "f8000000");
    }

    #[test]
    fn test_extranonce_wraps() {
        let mut counter = ExtranonceCounter {
            counter: u32::MAX,
        };
        assert_eq!(counter.next(), "ffffffff");
        assert_eq!(counter.next(), "00000000");
    }

    #[test]
    fn test_random_instance_ids_differ() {
        let first = random_instance_id();
        assert!((0..8).any(|_| random_instance_id() != first));
    }

    #[test]
    fn test_job_counter_sequence() {
        let mut counter = JobCounter::new();
        assert_eq!(counter.next(), "1");
        assert_eq!(counter.next(), "2");
        for _ in 0..8 {
            counter.next();
        }
        assert_eq!(counter.next(), "b");
    }

    #[test]
    fn test_job_counter_cycles_before_multiple_of_ffff() {
        let mut counter = JobCounter { counter: 0xfffd };
        assert_eq!(counter.next(), "fffe");
        assert_eq!(counter.next(), "1");
        assert_eq!(counter.next(), "2");
    }
}
