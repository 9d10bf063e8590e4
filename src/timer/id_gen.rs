//! Server-assigned timer id generation (spec §4.1 `generate_timer_id`,
//! §6.3 `identity.instance_id`/`identity.deployment_id`).
//!
//! Ids are 64 bits: the top 3 bits carry `deployment_id` (0-7), the next
//! 7 carry `instance_id` (0-127), and the low 54 bits are a per-process
//! counter seeded from a random starting point so that two processes
//! with the same identity that restart around the same time still don't
//! hand out colliding ids for timers created before either one's counter
//! has advanced far.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use rand::RngCore;

use super::TimerId;

const DEPLOYMENT_BITS: u32 = 3;
const INSTANCE_BITS: u32 = 7;
const COUNTER_BITS: u32 = 64 - DEPLOYMENT_BITS - INSTANCE_BITS;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

static COUNTER_SEED: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(rand::thread_rng().next_u64()));

/// A generator bound to one process's `deployment_id`/`instance_id`.
pub struct IdGenerator {
    prefix: u64,
}

impl IdGenerator {
    /// `deployment_id` must be 0-7, `instance_id` must be 0-127; out of
    /// range values are truncated to fit, matching the source's treatment
    /// of these as small bitfields rather than validated inputs.
    pub fn new(deployment_id: u8, instance_id: u8) -> Self {
        let deployment = (deployment_id as u64) & ((1 << DEPLOYMENT_BITS) - 1);
        let instance = (instance_id as u64) & ((1 << INSTANCE_BITS) - 1);
        let prefix = (deployment << (INSTANCE_BITS + COUNTER_BITS)) | (instance << COUNTER_BITS);
        IdGenerator { prefix }
    }

    /// Generates the next id for this process. Wraps around the counter
    /// field silently after 2^54 calls; at any plausible timer creation
    /// rate that's not a practical concern within a single process run.
    pub fn next_id(&self) -> TimerId {
        let counter = COUNTER_SEED.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
        self.prefix | counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_from_the_same_generator_are_distinct() {
        let gen = IdGenerator::new(2, 5);
        let a = gen.next_id();
        let b = gen.next_id();
        assert_ne!(a, b);
    }

    #[test]
    fn prefix_bits_carry_deployment_and_instance() {
        let gen = IdGenerator::new(3, 100);
        let id = gen.next_id();
        let deployment = (id >> (INSTANCE_BITS + COUNTER_BITS)) & ((1 << DEPLOYMENT_BITS) - 1);
        let instance = (id >> COUNTER_BITS) & ((1 << INSTANCE_BITS) - 1);
        assert_eq!(deployment, 3);
        assert_eq!(instance, 100);
    }

    #[test]
    fn out_of_range_inputs_are_truncated_not_rejected() {
        let gen = IdGenerator::new(0xFF, 0xFF);
        let id = gen.next_id();
        let deployment = (id >> (INSTANCE_BITS + COUNTER_BITS)) & ((1 << DEPLOYMENT_BITS) - 1);
        let instance = (id >> COUNTER_BITS) & ((1 << INSTANCE_BITS) - 1);
        assert_eq!(deployment, 0b111);
        assert_eq!(instance, 0b1111111);
    }
}
