//! End-to-end scenarios: a bridge attached to a recording store.

#[cfg(test)]
mod scenario_tests {
    use crate::bridge::{Bridge, BridgeStatus};
    use crate::config::BridgeOptions;
    use crate::core::{of_type, Action};
    use crate::operators::take_from;
    use crate::process::{Process, ProcessContext};
    use crate::store::{MiddlewareApi, Next, Store};
    use crate::supervisor::Exit;
    use crate::testing::{eventually, init_tracing, recording_reducer, shared_latch, Recorded};
    use futures::stream::{self, StreamExt};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn attach(bridge: &Bridge<Recorded>) -> Store<Recorded> {
        Store::builder(recording_reducer)
            .middleware(bridge.middleware())
            .build()
            .unwrap()
    }

    async fn wait_for(store: &Store<Recorded>, kind: &str, count: usize) {
        eventually(WAIT, || store.get_state().count(kind) >= count)
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "timed out waiting for {count} x {kind}, got {:?}",
                    store.get_state().types()
                )
            });
    }

    fn relay(name: &str, from: &'static str, to: &'static str) -> Process<Recorded> {
        Process::make(name, move |actions, _state| {
            actions
                .filter(move |a| futures::future::ready(a.is(from)))
                .map(move |_| Action::new(to))
        })
    }

    // ==========================================================================
    // Relays and ordering
    // ==========================================================================

    #[tokio::test]
    async fn test_two_relays_interleave_with_host_dispatches() {
        init_tracing();
        let bridge = Bridge::new(Process::all(
            "root",
            [
                relay("fire-1", "FIRE_1", "ACTION_1"),
                relay("fire-2", "FIRE_2", "ACTION_2"),
            ],
        ))
        .unwrap();
        let store = attach(&bridge);

        store.dispatch(Action::new("FIRE_1")).unwrap();
        wait_for(&store, "ACTION_1", 1).await;
        store.dispatch(Action::new("FIRE_2")).unwrap();
        wait_for(&store, "ACTION_2", 1).await;

        assert_eq!(
            store.get_state().types(),
            vec![Action::INIT_TYPE, "FIRE_1", "ACTION_1", "FIRE_2", "ACTION_2"]
        );
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscribers_see_host_order() {
        let bridge = Bridge::new(Process::from_fn("idle", |ctx: ProcessContext<Recorded>| async move {
            ctx.interrupted().await;
            Ok(())
        }))
        .unwrap();
        let store = attach(&bridge);
        bridge.settle_timeout(WAIT).await.unwrap();

        let mut first = bridge.service().action().subscribe();
        let mut second = bridge.service().action().subscribe();
        for n in 0..20 {
            store.dispatch(Action::new("STEP").with_payload(n)).unwrap();
        }

        for subscriber in [&mut first, &mut second] {
            for n in 0..20 {
                let action = subscriber.recv().await.unwrap();
                assert_eq!(action.payload(), Some(&json!(n)));
            }
        }
        bridge.shutdown().await;
    }

    // ==========================================================================
    // take_every
    // ==========================================================================

    #[tokio::test]
    async fn test_take_every_forks_only_before_watcher_is_stopped() {
        let latch = shared_latch(5);
        let calls: Arc<Mutex<Vec<(String, usize, Option<Value>)>>> = Arc::default();

        let root = {
            let latch = latch.clone();
            let calls = calls.clone();
            Process::from_fn("root", move |ctx: ProcessContext<Recorded>| async move {
                let watcher = ctx.take_every(
                    of_type("ACTION"),
                    ("first".to_string(), 2usize),
                    move |action, (a, b)| {
                        let latch = latch.clone();
                        let calls = calls.clone();
                        async move {
                            calls.lock().unwrap().push((a, b, action.payload().cloned()));
                            latch.dec();
                            Ok(())
                        }
                    },
                );
                ctx.take_required(of_type("CANCEL_WATCHER")).await?;
                watcher.interrupt_and_join().await;
                Ok(())
            })
        };
        let bridge = Bridge::new(root).unwrap();
        let store = attach(&bridge);

        for n in 0..5 {
            store.dispatch(Action::new("ACTION").with_payload(n)).unwrap();
        }
        tokio::task::yield_now().await;
        store.dispatch(Action::new("CANCEL_WATCHER")).unwrap();
        tokio::task::yield_now().await;
        for n in 5..10 {
            store.dispatch(Action::new("ACTION").with_payload(n)).unwrap();
        }

        assert!(bridge.join().await.is_success());
        bridge.settle_timeout(WAIT).await.unwrap();
        tokio::time::timeout(WAIT, latch.await_zero()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut calls = calls.lock().unwrap().clone();
        calls.sort_by_key(|(_, _, payload)| payload.as_ref().and_then(Value::as_i64));
        assert_eq!(calls.len(), 5);
        for (n, (a, b, payload)) in calls.into_iter().enumerate() {
            assert_eq!(a, "first");
            assert_eq!(b, 2);
            assert_eq!(payload, Some(json!(n)));
        }
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_stopping_watcher_leaves_forked_workers_running() {
        let subscribed = shared_latch(1);
        let root = {
            let subscribed = subscribed.clone();
            Process::from_fn("root", move |ctx: ProcessContext<Recorded>| async move {
                let watcher = ctx.take_every(
                    of_type("JOB"),
                    (ctx.clone(), subscribed),
                    |_, (ctx, subscribed)| async move {
                        let mut actions = ctx.actions();
                        subscribed.dec();
                        take_from(&mut actions, of_type("RELEASE")).await;
                        ctx.put(Action::new("WORKER_DONE"))?;
                        Ok(())
                    },
                );
                ctx.take_required(of_type("STOP_WATCHING")).await?;
                watcher.interrupt_and_join().await;
                ctx.put(Action::new("WATCHER_STOPPED"))?;
                ctx.interrupted().await;
                Ok(())
            })
        };
        let bridge = Bridge::new(root).unwrap();
        let store = attach(&bridge);

        store.dispatch(Action::new("JOB")).unwrap();
        tokio::time::timeout(WAIT, subscribed.await_zero()).await.unwrap();

        store.dispatch(Action::new("STOP_WATCHING")).unwrap();
        wait_for(&store, "WATCHER_STOPPED", 1).await;

        store.dispatch(Action::new("RELEASE")).unwrap();
        wait_for(&store, "WORKER_DONE", 1).await;
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_workers() {
        let started = shared_latch(1);
        let released = Arc::new(AtomicBool::new(false));

        struct Release(Arc<AtomicBool>);
        impl Drop for Release {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let root = {
            let started = started.clone();
            let released = released.clone();
            Process::from_fn("root", move |ctx: ProcessContext<Recorded>| async move {
                ctx.take_every(of_type("JOB"), (started, released), |_, (started, released)| async move {
                    let _release = Release(released);
                    started.dec();
                    futures::future::pending::<()>().await;
                    Ok(())
                });
                ctx.interrupted().await;
                Ok(())
            })
        };
        let bridge = Bridge::new(root).unwrap();
        let store = attach(&bridge);

        store.dispatch(Action::new("JOB")).unwrap();
        tokio::time::timeout(WAIT, started.await_zero()).await.unwrap();

        assert!(bridge.shutdown().await.is_interrupted());
        eventually(WAIT, || released.load(Ordering::SeqCst)).await.unwrap();
    }

    // ==========================================================================
    // Startup and replay
    // ==========================================================================

    #[tokio::test]
    async fn test_startup_emission_reaches_host_and_siblings() {
        let boot = Process::from_stream("boot", stream::iter([Action::new("BOOTED")]));
        let sibling = Process::from_fn("sibling", |ctx: ProcessContext<Recorded>| async move {
            ctx.take_required(of_type("BOOTED")).await?;
            ctx.put(Action::new("SIBLING_SAW_BOOT"))?;
            Ok(())
        });
        let bridge = Bridge::new(Process::all("root", [boot, sibling])).unwrap();
        let store = attach(&bridge);

        assert!(bridge.join().await.is_success());
        wait_for(&store, "SIBLING_SAW_BOOT", 1).await;
        assert_eq!(
            store.get_state().types(),
            vec![Action::INIT_TYPE, "BOOTED", "SIBLING_SAW_BOOT"]
        );
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay_window() {
        let bridge = Bridge::builder()
            .options(BridgeOptions::default().with_replay(2))
            .spawn(Process::from_fn("idle", |ctx: ProcessContext<Recorded>| async move {
                ctx.interrupted().await;
                Ok(())
            }))
            .unwrap();
        let store = attach(&bridge);

        for n in 1..=4 {
            store.dispatch(Action::new("A").with_payload(n)).unwrap();
        }
        bridge.settle_timeout(WAIT).await.unwrap();

        let mut late = bridge.service().action().subscribe();
        store.dispatch(Action::new("A").with_payload(5)).unwrap();

        for n in 3..=5 {
            assert_eq!(late.recv().await.unwrap().payload(), Some(&json!(n)));
        }
        bridge.shutdown().await;
    }

    // ==========================================================================
    // State
    // ==========================================================================

    #[tokio::test]
    async fn test_select_after_take_is_at_least_as_new() {
        let observed: Arc<Mutex<Vec<usize>>> = Arc::default();
        let root = {
            let observed = observed.clone();
            Process::from_fn("counter", move |ctx: ProcessContext<Recorded>| async move {
                let mut actions = ctx.actions();
                while take_from(&mut actions, of_type("INC")).await.is_some() {
                    let seen = ctx.select(|state| state.count("INC"));
                    observed.lock().unwrap().push(seen);
                    ctx.put(Action::new("SEEN").with_payload(seen))?;
                }
                Ok(())
            })
        };
        let bridge = Bridge::new(root).unwrap();
        let store = attach(&bridge);

        for _ in 0..10 {
            store.dispatch(Action::new("INC")).unwrap();
        }
        wait_for(&store, "SEEN", 10).await;

        let observed = observed.lock().unwrap().clone();
        assert_eq!(observed.len(), 10);
        for (i, seen) in observed.iter().enumerate() {
            assert!(*seen > i, "take #{i} observed a state with only {seen} INC");
        }
        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        bridge.shutdown().await;
    }

    // ==========================================================================
    // Lifecycle
    // ==========================================================================

    #[tokio::test]
    async fn test_teardown_is_idempotent_after_completion() {
        let bridge = Bridge::new(Process::from_fn("done", |_: ProcessContext<Recorded>| async {
            Ok(())
        }))
        .unwrap();
        let _store = attach(&bridge);

        assert!(bridge.join().await.is_success());
        bridge.interrupt();
        bridge.interrupt();
        assert!(bridge.join().await.is_success());
        assert!(bridge.shutdown().await.is_success());
        assert!(bridge.shutdown().await.is_success());
        assert_eq!(bridge.status(), BridgeStatus::ShutDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_interrupts_siblings() {
        let failing = Process::from_fn("failing", |_: ProcessContext<Recorded>| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            anyhow::bail!("boom")
        });
        let slow = Process::from_fn("slow", |ctx: ProcessContext<Recorded>| async move {
            ctx.put(Action::new("ACTION-1"))?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.put(Action::new("ACTION-2"))?;
            Ok(())
        });
        let bridge = Bridge::new(Process::all("root", [failing, slow])).unwrap();
        let store = attach(&bridge);

        match bridge.join().await {
            Exit::Failure(e) => assert!(e.to_string().contains("boom")),
            other => panic!("expected failure, got {other}"),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        bridge.settle().await;

        assert_eq!(store.get_state().types(), vec![Action::INIT_TYPE, "ACTION-1"]);
        assert!(matches!(
            bridge.status(),
            BridgeStatus::Faulted(crate::TandemError::ProcessTreeFailed { .. })
        ));
        bridge.shutdown().await;
    }

    /// A root that forks a `take_every` watcher, then fails the way `fail`
    /// says once it sees `FAIL`.
    fn failing_root(fail: fn() -> anyhow::Result<()>) -> Process<Recorded> {
        Process::from_fn("root", move |ctx: ProcessContext<Recorded>| async move {
            ctx.take_every(of_type("JOB"), ctx.clone(), |_, ctx| async move {
                ctx.put(Action::new("WORKER_PUT"))?;
                Ok(())
            });
            ctx.take_required(of_type("FAIL")).await?;
            fail()
        })
    }

    async fn assert_tree_stops(bridge: &Bridge<Recorded>, store: &Store<Recorded>) {
        store.dispatch(Action::new("JOB")).unwrap();
        wait_for(store, "WORKER_PUT", 1).await;

        store.dispatch(Action::new("FAIL")).unwrap();
        let mut status = bridge.watch_status();
        tokio::time::timeout(WAIT, status.wait_for(|s| !s.is_running()))
            .await
            .unwrap()
            .unwrap();
        match bridge.status() {
            BridgeStatus::Faulted(crate::TandemError::ProcessTreeFailed { process, .. }) => {
                assert_eq!(process, "root")
            }
            other => panic!("expected process tree failure, got {other:?}"),
        }

        // The watcher is gone with the tree; the host keeps reducing.
        store.dispatch(Action::new("JOB")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get_state().count("JOB"), 2);
        assert_eq!(store.get_state().count("WORKER_PUT"), 1);
    }

    #[tokio::test]
    async fn test_root_failure_faults_bridge() {
        let bridge = Bridge::new(failing_root(|| anyhow::bail!("root failed"))).unwrap();
        let store = attach(&bridge);

        assert_tree_stops(&bridge, &store).await;
        match bridge.join().await {
            Exit::Failure(e) => assert!(e.to_string().contains("root failed")),
            other => panic!("expected failure, got {other}"),
        }
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_root_panic_faults_bridge() {
        let bridge = Bridge::new(failing_root(|| panic!("root defect"))).unwrap();
        let store = attach(&bridge);

        assert_tree_stops(&bridge, &store).await;
        match bridge.join().await {
            Exit::Defect(msg) => assert!(msg.contains("root defect")),
            other => panic!("expected defect, got {other}"),
        }
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_keeps_siblings_running() {
        let risky = Process::from_fn("risky", |ctx: ProcessContext<Recorded>| async move {
            ctx.take_required(of_type("GO")).await?;
            anyhow::bail!("domain failure")
        })
        .recover(|e| Some(Action::new("RECOVERED").with_payload(e.to_string())));
        let steady = Process::from_fn("steady", |ctx: ProcessContext<Recorded>| async move {
            let mut actions = ctx.actions();
            take_from(&mut actions, of_type("GO")).await;
            take_from(&mut actions, of_type("AFTER")).await;
            ctx.put(Action::new("STEADY_DONE"))?;
            Ok(())
        });
        let bridge = Bridge::new(Process::all("root", [risky, steady])).unwrap();
        let store = attach(&bridge);

        store.dispatch(Action::new("GO")).unwrap();
        wait_for(&store, "RECOVERED", 1).await;
        store.dispatch(Action::new("AFTER")).unwrap();
        wait_for(&store, "STEADY_DONE", 1).await;

        let recovered = store
            .get_state()
            .actions
            .into_iter()
            .find(|a| a.is("RECOVERED"))
            .unwrap();
        assert_eq!(recovered.payload(), Some(&json!("domain failure")));
        assert!(bridge.join().await.is_success());
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_put_goes_through_the_whole_chain() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let spy = {
            let seen = seen.clone();
            move |_api: Arc<dyn MiddlewareApi<Recorded>>, next: Next| -> anyhow::Result<Next> {
                let seen = seen.clone();
                Ok(Arc::new(move |action: Action| {
                    seen.lock().unwrap().push(action.kind().to_string());
                    next(action)
                }))
            }
        };
        let root = Process::from_fn("ping", |ctx: ProcessContext<Recorded>| async move {
            ctx.take_required(of_type("PING")).await?;
            let kind = ctx.put(Action::new("PONG"))?;
            anyhow::ensure!(&*kind == "PONG", "put returned {kind}");
            Ok(())
        });
        let bridge = Bridge::new(root).unwrap();
        let store = Store::builder(recording_reducer)
            .middleware(spy)
            .middleware(bridge.middleware())
            .build()
            .unwrap();

        store.dispatch(Action::new("PING")).unwrap();
        assert!(bridge.join().await.is_success());
        wait_for(&store, "PONG", 1).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Action::INIT_TYPE, "PING", "PONG"]
        );
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_future_stops_drain() {
        let root = Process::all(
            "root",
            [
                Process::from_future("lookup", async {
                    Err::<Action, _>(anyhow::anyhow!("lookup failed"))
                })
                .isolated(),
                Process::from_fn("idle", |ctx: ProcessContext<Recorded>| async move {
                    ctx.interrupted().await;
                    Ok(())
                }),
            ],
        );
        let bridge = Bridge::new(root).unwrap();
        let store = attach(&bridge);

        let mut status = bridge.watch_status();
        tokio::time::timeout(WAIT, status.wait_for(|s| !s.is_running()))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            bridge.status(),
            BridgeStatus::Faulted(crate::TandemError::ProducerFailed { .. })
        ));

        store.dispatch(Action::new("STILL_REDUCED")).unwrap();
        assert_eq!(store.get_state().count("STILL_REDUCED"), 1);
        bridge.shutdown().await;
    }
}
