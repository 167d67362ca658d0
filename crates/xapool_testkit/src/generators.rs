//! Property-based test generators using proptest.
//!
//! Provides strategies for pool configurations, borrow/release workloads
//! and XIDs.

use proptest::prelude::*;
use std::time::Duration;
use xapool_core::{IdleOrder, PoolConfig, FORMAT_ID};
use xapool_resource::{Xid, MAX_BQUAL_SIZE, MAX_GTRID_SIZE};

/// One step of a data source workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolOp {
    /// Borrow a connection outside any transaction.
    Borrow,
    /// Release the n-th held connection (modulo the number held).
    Release(usize),
    /// Execute a statement on the n-th held connection.
    Execute(usize),
    /// Break every open physical connection.
    BreakConnections,
    /// Run an eviction pass.
    Evict,
}

/// Strategy for generating workload steps.
pub fn pool_op_strategy() -> impl Strategy<Value = PoolOp> {
    prop_oneof![
        4 => Just(PoolOp::Borrow),
        4 => any::<usize>().prop_map(PoolOp::Release),
        2 => any::<usize>().prop_map(PoolOp::Execute),
        1 => Just(PoolOp::BreakConnections),
        1 => Just(PoolOp::Evict),
    ]
}

/// Strategy for generating workloads.
pub fn pool_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<PoolOp>> {
    prop::collection::vec(pool_op_strategy(), 1..max_len)
}

/// Strategy for generating valid pool configurations with a short wait.
pub fn pool_config_strategy() -> impl Strategy<Value = PoolConfig> {
    (1usize..6, any::<bool>(), any::<bool>(), any::<bool>())
        .prop_flat_map(|(max_total, fifo, test_on_return, test_while_idle)| {
            (0..=max_total).prop_map(move |min_idle| {
                PoolConfig::new()
                    .max_total(max_total)
                    .min_idle(min_idle)
                    .max_wait(Duration::from_millis(5))
                    .idle_order(if fifo { IdleOrder::Fifo } else { IdleOrder::Lifo })
                    .test_on_return(test_on_return)
                    .test_while_idle(test_while_idle)
            })
        })
}

/// Strategy for generating write statements.
pub fn statement_strategy() -> impl Strategy<Value = String> {
    (1u32..1000).prop_map(|n| format!("insert into t values ({n})"))
}

/// Strategy for generating XIDs in this crate's format.
pub fn coordinator_xid_strategy() -> impl Strategy<Value = Xid> {
    (
        prop::collection::vec(any::<u8>(), 1..=MAX_GTRID_SIZE),
        prop::collection::vec(any::<u8>(), 0..=MAX_BQUAL_SIZE),
    )
        .prop_map(|(gtrid, bqual)| {
            Xid::new(FORMAT_ID, &gtrid, &bqual).expect("Generated XID within limits")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{test_config, TestEnv};
    use xapool_core::ManagedConnection;

    fn run_workload(config: PoolConfig, ops: Vec<PoolOp>) -> Result<(), TestCaseError> {
        let mut ds_config = test_config()
            .max_total(config.max_total)
            .min_idle(config.min_idle)
            .max_wait(config.max_wait);
        ds_config.idle_order = config.idle_order;
        ds_config.test_on_return = config.test_on_return;
        ds_config.test_while_idle = config.test_while_idle;

        let env = TestEnv::new(ds_config);
        let mut held: Vec<ManagedConnection> = Vec::new();

        for op in ops {
            match op {
                PoolOp::Borrow => match env.get_connection(None) {
                    Ok(conn) => held.push(conn),
                    Err(e) => {
                        // only a full pool may refuse
                        prop_assert!(e.is_pool_exhausted(), "unexpected error: {}", e);
                        prop_assert_eq!(held.len(), config.max_total);
                    }
                },
                PoolOp::Release(n) if !held.is_empty() => {
                    let index = n % held.len();
                    drop(held.swap_remove(index));
                }
                PoolOp::Execute(n) if !held.is_empty() => {
                    let index = n % held.len();
                    // broken connections may fail; the pool must still recover
                    let _ = held[index].execute("insert into t values (1)");
                }
                PoolOp::BreakConnections => env.source.break_open_connections(),
                PoolOp::Evict => {
                    env.pool().evict();
                }
                PoolOp::Release(_) | PoolOp::Execute(_) => {}
            }

            let stats = env.stats();
            prop_assert_eq!(stats.active, held.len());
            prop_assert!(stats.total <= config.max_total);
            prop_assert_eq!(stats.total, stats.idle + stats.active);
            prop_assert!(env.source.open_connections() <= config.max_total);
        }

        drop(held);
        prop_assert_eq!(env.stats().active, 0);
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn data_source_bookkeeping_holds(
            config in pool_config_strategy(),
            ops in pool_ops_strategy(40),
        ) {
            run_workload(config, ops)?;
        }
    }

    proptest! {
        #[test]
        fn generated_configs_are_valid(config in pool_config_strategy()) {
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn generated_xids_carry_the_format(xid in coordinator_xid_strategy()) {
            prop_assert_eq!(xid.format_id(), FORMAT_ID);
            prop_assert!(!xid.gtrid().is_empty());
        }
    }
}
