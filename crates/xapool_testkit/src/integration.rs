//! Cross-crate integration test helpers.
//!
//! Scenarios driving the pool, the transaction registry and the
//! transaction manager together through a managed data source.

use crate::fixtures::TestEnv;
use std::thread;
use std::time::{Duration, Instant};
use xapool_core::{CoreResult, ManagedDataSource, TransactionStatus};

/// Polls `condition` until it holds or `timeout` passes.
///
/// Returns the last value of `condition`.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Runs `statements` in one transaction and commits it.
///
/// Every statement asks the data source for a connection again, so all
/// but the first reuse the enlisted one.
pub fn commit_writes(env: &TestEnv, statements: &[&str]) -> CoreResult<TransactionStatus> {
    let txn = env.tm.begin();
    for statement in statements {
        let result = env
            .get_connection(Some(&txn))
            .and_then(|mut conn| conn.execute(statement));
        if let Err(e) = result {
            env.tm.rollback(&txn)?;
            return Err(e);
        }
    }
    env.tm.commit(&txn)
}

/// Asserts that nothing is on loan or waiting and every transaction
/// released its connections.
pub fn assert_settled(ds: &ManagedDataSource) {
    let stats = ds.stats();
    assert_eq!(stats.active, 0, "connections still on loan: {stats:?}");
    assert_eq!(stats.waiters, 0, "borrowers still waiting: {stats:?}");
    assert_eq!(stats.total, stats.idle, "pool not settled: {stats:?}");
    assert!(
        ds.transaction_registry().active_transactions().is_empty(),
        "transactions still hold connections"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{test_config, with_env};
    use std::sync::mpsc;
    use std::sync::Arc;
    use xapool_core::{
        CoreError, IdleOrder, TransactionManager, XaDataSourceWrapper, XaPoolWrapper,
    };

    #[test]
    fn third_borrower_times_out_then_succeeds_after_return() {
        let env = TestEnv::new(
            test_config()
                .max_total(2)
                .max_wait(Duration::from_millis(100)),
        );

        let first = env.get_connection(None).unwrap();
        let _second = env.get_connection(None).unwrap();

        let started = Instant::now();
        let err = env.get_connection(None).unwrap_err();
        let waited = started.elapsed();
        assert!(err.is_pool_exhausted(), "unexpected error: {err}");
        assert!(waited >= Duration::from_millis(100), "gave up after {waited:?}");
        assert!(waited < Duration::from_secs(2), "waited {waited:?}");

        drop(first);
        let third = env.get_connection(None).unwrap();
        assert!(third.transaction().is_none());
        assert_eq!(env.source.opened_connections(), 2);
    }

    #[test]
    fn returned_connection_is_reused() {
        with_env(test_config(), |env| {
            let id = env.get_connection(None).unwrap().id();
            let again = env.get_connection(None).unwrap();
            assert_eq!(again.id(), id);
            assert_eq!(env.source.opened_connections(), 1);
        });
    }

    #[test]
    fn broken_idle_connection_is_replaced_transparently() {
        with_env(test_config(), |env| {
            let id = env.get_connection(None).unwrap().id();
            env.source.break_open_connections();

            let mut conn = env.get_connection(None).unwrap();
            assert_ne!(conn.id(), id);
            conn.execute("insert into t values (1)").unwrap();

            let stats = env.stats();
            assert_eq!(stats.destroyed, 1);
            assert_eq!(stats.total, 1);
            assert_eq!(env.source.open_connections(), 1);
        });
    }

    #[test]
    fn connection_broken_on_loan_is_not_recycled() {
        let mut config = test_config();
        config.test_on_borrow = false;
        with_env(config, |env| {
            let conn = env.get_connection(None).unwrap();
            let id = conn.id();
            env.source.break_open_connections();
            drop(conn);

            let stats = env.stats();
            assert_eq!(stats.idle, 0);
            assert_eq!(stats.destroyed, 1);
            assert_ne!(env.get_connection(None).unwrap().id(), id);
        });
    }

    #[test]
    fn validation_query_is_used_when_configured() {
        with_env(test_config().validation_query("select 1"), |env| {
            let id = env.get_connection(None).unwrap().id();
            assert_eq!(env.get_connection(None).unwrap().id(), id);

            env.source.break_open_connections();
            assert_ne!(env.get_connection(None).unwrap().id(), id);
        });
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let env = TestEnv::new(test_config().max_total(1).max_wait(Duration::from_secs(5)));
        let held = env.get_connection(None).unwrap();
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for (queued, name) in [(1, "A"), (2, "B")] {
                let tx = tx.clone();
                let env = &env;
                scope.spawn(move || {
                    let conn = env.get_connection(None).unwrap();
                    tx.send(name).unwrap();
                    thread::sleep(Duration::from_millis(20));
                    drop(conn);
                });
                // let the waiter queue up before the next one arrives
                wait_until(Duration::from_secs(2), || env.stats().waiters >= queued);
            }
            assert_eq!(env.stats().waiters, 2);
            drop(held);
        });

        let order: Vec<&str> = rx.try_iter().collect();
        assert_eq!(order, vec!["A", "B"]);
    }

    #[test]
    fn close_wakes_blocked_borrowers() {
        let env = TestEnv::new(test_config().max_total(1).max_wait(Duration::from_secs(10)));
        let held = env.get_connection(None).unwrap();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let started = Instant::now();
                let result = env.get_connection(None);
                (result, started.elapsed())
            });

            wait_until(Duration::from_secs(2), || env.stats().waiters > 0);
            env.close();

            let (result, waited) = waiter.join().unwrap();
            let err = result.unwrap_err();
            assert!(matches!(err.root(), CoreError::PoolClosed), "unexpected error: {err}");
            assert!(waited < Duration::from_secs(5));
        });

        // connections returned after close are destroyed
        drop(held);
        assert_eq!(env.source.open_connections(), 0);
    }

    #[test]
    fn eviction_closes_only_idle_connections() {
        let env = TestEnv::new(
            test_config()
                .max_idle(Duration::from_millis(30))
                .eviction_interval(Duration::from_millis(10)),
        );
        let held = env.get_connection(None).unwrap();
        drop(env.get_connection(None).unwrap());
        let _held_too = env.get_connection(None).unwrap();
        drop(env.get_connection(None).unwrap());
        assert_eq!(env.source.open_connections(), 3);

        assert!(wait_until(Duration::from_secs(5), || env.stats().idle == 0));

        let stats = env.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(env.source.open_connections(), 2);
        drop(held);
    }

    #[test]
    fn eviction_restores_min_idle() {
        let env = TestEnv::new(test_config().min_idle(2).max_idle(Duration::from_millis(20)));
        assert_eq!(env.stats().idle, 2);

        thread::sleep(Duration::from_millis(40));
        let report = env.pool().evict();
        assert_eq!(report.examined, 2);
        assert_eq!(report.evicted, 2);
        assert_eq!(report.created, 2);

        let stats = env.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.created, 4);
        assert_eq!(env.source.open_connections(), 2);
    }

    #[test]
    fn idle_order_is_configurable() {
        for (order, expect_last_returned) in [(IdleOrder::Lifo, true), (IdleOrder::Fifo, false)] {
            let mut config = test_config();
            config.idle_order = order;
            with_env(config, |env| {
                let a = env.get_connection(None).unwrap();
                let b = env.get_connection(None).unwrap();
                let (a_id, b_id) = (a.id(), b.id());
                drop(a);
                drop(b);

                let next = env.get_connection(None).unwrap().id();
                let expected = if expect_last_returned { b_id } else { a_id };
                assert_eq!(next, expected, "{order:?}");
            });
        }
    }

    #[test]
    fn unreachable_resource_is_retryable() {
        with_env(test_config(), |env| {
            env.source.set_reachable(false);
            let err = env.get_connection(None).unwrap_err();
            assert!(err.is_resource_unavailable());
            assert!(err.is_retryable());
            assert_eq!(env.stats().total, 0);

            env.source.set_reachable(true);
            assert!(env.get_connection(None).is_ok());
        });
    }

    #[test]
    fn connection_is_enlisted_and_reused_within_a_transaction() {
        with_env(test_config(), |env| {
            let txn = env.tm.begin();

            let mut conn = env.get_connection(Some(&txn)).unwrap();
            assert_eq!(conn.transaction(), Some(txn.id()));
            conn.execute("insert into t values (1)").unwrap();
            let id = conn.id();
            drop(conn);

            let mut conn = env.get_connection(Some(&txn)).unwrap();
            assert_eq!(conn.id(), id);
            conn.execute("insert into t values (2)").unwrap();
            drop(conn);

            assert_eq!(env.tm.branch_count(&txn), 1);
            assert!(env.source.committed_statements().is_empty());

            assert_eq!(env.tm.commit(&txn).unwrap(), TransactionStatus::Committed);
            assert_eq!(
                env.source.committed_statements(),
                vec!["insert into t values (1)", "insert into t values (2)"]
            );
            assert_eq!(env.stats().idle, 1);
            assert_settled(env);
        });
    }

    #[test]
    fn rollback_discards_work_and_recycles_connection() {
        with_env(test_config(), |env| {
            let txn = env.tm.begin();
            let mut conn = env.get_connection(Some(&txn)).unwrap();
            conn.execute("insert into t values (1)").unwrap();
            drop(conn);

            env.tm.rollback(&txn).unwrap();
            assert!(env.source.committed_statements().is_empty());
            assert_eq!(env.stats().idle, 1);

            // the same physical connection serves the next transaction
            commit_writes(env, &["insert into t values (2)"]).unwrap();
            assert_eq!(env.source.committed_statements(), vec!["insert into t values (2)"]);
            assert_eq!(env.source.opened_connections(), 1);
        });
    }

    #[test]
    fn two_resources_commit_in_two_phases() {
        let env = TestEnv::new(test_config());
        let (other_source, other) = env.add_resource("memory://db2");

        let txn = env.tm.begin();
        env.get_connection(Some(&txn))
            .unwrap()
            .execute("insert into a values (1)")
            .unwrap();
        other
            .get_connection(Some(&txn))
            .unwrap()
            .execute("insert into b values (1)")
            .unwrap();
        assert_eq!(env.tm.branch_count(&txn), 2);

        env.tm.commit(&txn).unwrap();
        assert_eq!(env.source.committed_statements(), vec!["insert into a values (1)"]);
        assert_eq!(other_source.committed_statements(), vec!["insert into b values (1)"]);
        assert_settled(&env);
        assert_settled(&other);

        // nothing is left for recovery
        let report = env.recovery.scan();
        assert_eq!(report.helpers_scanned, 2);
        assert_eq!(report.resolved(), 0);
    }

    #[test]
    fn rollback_only_transaction_rolls_back_every_branch() {
        let env = TestEnv::new(test_config());
        let (other_source, other) = env.add_resource("memory://db2");

        let txn = env.tm.begin();
        env.get_connection(Some(&txn))
            .unwrap()
            .execute("insert into a values (1)")
            .unwrap();
        other
            .get_connection(Some(&txn))
            .unwrap()
            .execute("insert into b values (1)")
            .unwrap();

        env.tm.set_rollback_only(&txn).unwrap();
        let err = env.tm.commit(&txn).unwrap_err();
        assert!(matches!(err, CoreError::TransactionRolledBack { .. }));

        assert!(env.source.committed_statements().is_empty());
        assert!(other_source.committed_statements().is_empty());
        assert_eq!(env.stats().idle, 1);
        assert_eq!(other.stats().idle, 1);
    }

    #[test]
    fn held_connection_blocks_a_second_request_in_the_same_transaction() {
        with_env(test_config(), |env| {
            let txn = env.tm.begin();
            let _held = env.get_connection(Some(&txn)).unwrap();

            let err = env.get_connection(Some(&txn)).unwrap_err();
            assert!(matches!(err, CoreError::ConnectionInUse { .. }));
            assert_eq!(env.tm.branch_count(&txn), 1);
        });
    }

    #[test]
    fn resource_wrapped_twice_gets_one_branch_per_transaction() {
        with_env(test_config(), |env| {
            let other = XaPoolWrapper::new(env.tm.clone(), env.recovery.clone(), test_config())
                .unwrap()
                .wrap_data_source(Arc::new(env.source.clone()))
                .unwrap();
            let txn = env.tm.begin();

            let mut conn = env.get_connection(Some(&txn)).unwrap();
            conn.execute("insert into t values (1)").unwrap();
            let err = other.get_connection(Some(&txn)).unwrap_err();
            assert!(matches!(err, CoreError::ConnectionInUse { .. }));
            drop(conn);

            assert_eq!(env.tm.branch_count(&txn), 1);
            assert_eq!(env.source.branch_count(), 1);
            assert_eq!(other.stats().active, 0);

            env.tm.commit(&txn).unwrap();
            assert_eq!(env.source.committed_statements(), vec!["insert into t values (1)"]);
            assert_eq!(env.recovery.helper_count(), 1);
            assert_settled(&other);
        });
    }

    #[test]
    fn transactions_do_not_share_connections() {
        with_env(test_config(), |env| {
            let first = env.tm.begin();
            let second = env.tm.begin();

            let a = env.get_connection(Some(&first)).unwrap();
            let b = env.get_connection(Some(&second)).unwrap();
            assert_ne!(a.id(), b.id());
            drop((a, b));

            env.tm.commit(&first).unwrap();
            env.tm.commit(&second).unwrap();
            assert_eq!(env.stats().idle, 2);
        });
    }

    #[test]
    fn completed_transaction_is_rejected() {
        with_env(test_config(), |env| {
            let txn = env.tm.begin();
            env.tm.commit(&txn).unwrap();
            assert!(matches!(
                env.get_connection(Some(&txn)),
                Err(CoreError::TransactionNotActive(_))
            ));
        });
    }

    #[test]
    fn exhausted_pool_inside_a_transaction() {
        let env = TestEnv::new(test_config().max_total(1).max_wait(Duration::from_millis(20)));
        let outside = env.get_connection(None).unwrap();

        let err = commit_writes(&env, &["insert into t values (1)"]).unwrap_err();
        assert!(matches!(err, CoreError::DataSourceUnavailable(_)));
        assert!(err.is_pool_exhausted());
        assert_eq!(env.tm.active_count(), 0);

        drop(outside);
        assert_settled(&env);
    }

    #[test]
    fn concurrent_transactions_commit_independently() {
        let env = TestEnv::new(test_config().max_total(3));

        thread::scope(|scope| {
            for t in 0..6 {
                let env = &env;
                scope.spawn(move || {
                    for i in 0..10 {
                        let statement = format!("insert into t values ({t}, {i})");
                        commit_writes(env, &[&statement]).unwrap();
                    }
                });
            }
        });

        assert_eq!(env.source.committed_statements().len(), 60);
        assert!(env.stats().total <= 3);
        assert_eq!(env.tm.active_count(), 0);
        assert_settled(&env);
    }

    #[test]
    fn helpers_report_progress() {
        let mut calls = 0;
        assert!(wait_until(Duration::from_secs(1), || {
            calls += 1;
            calls == 3
        }));
        assert!(!wait_until(Duration::from_millis(5), || false));
    }
}
