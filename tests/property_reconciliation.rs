//! Property tests of the resolvers and interceptors.

mod common;

use std::sync::Arc;

use common::{accepted_tasks, in_state, service_job, started, Fixture, JOB_ID};
use convoy::domain::models::{reason, Job, RateLimitConfig, RetryConfig, RetryPolicy, Task, TaskState};
use convoy::domain::ports::{Clock, TestClock};
use convoy::services::interceptors::{RateLimiterInterceptor, RetryActionInterceptor};
use convoy::services::jobmanager::{job_tree, JobAction};
use convoy::services::reconciler::{ChangeKind, DifferenceResolver, EventSink, ReconciliationEngine};
use proptest::prelude::*;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

proptest! {
    /// Property: a settled service tree resolves to nothing
    #[test]
    fn prop_settled_service_tree_is_idempotent(desired in 0u32..8) {
        let fixture = Fixture::new(10);
        let resolver = fixture.service_resolver();
        let tasks: Vec<Task> = accepted_tasks(desired as usize).iter().map(started).collect();
        let tree = job_tree(&service_job(desired, 3), &tasks);

        let actions = resolver.resolve(&tree, &tree, &tree).unwrap();
        prop_assert!(actions.is_empty(), "unexpected {} actions", actions.len());
    }

    /// Property: a settled batch tree resolves to nothing
    #[test]
    fn prop_settled_batch_tree_is_idempotent(size in 1u32..8) {
        let fixture = Fixture::new(10);
        let resolver = fixture.batch_resolver();
        let job = Job::batch(JOB_ID, "report", size, RetryPolicy::default(), 0);
        let tasks: Vec<Task> = (0..size).map(|i| started(&Task::new(JOB_ID, Some(i), 0))).collect();
        let tree = job_tree(&job, &tasks);

        prop_assert!(resolver.resolve(&tree, &tree, &tree).unwrap().is_empty());
    }

    /// Property: scaling from N to M kills exactly N - M tasks, counting
    /// those already being killed, and never kills one twice
    #[test]
    fn prop_scale_down_kills_exact_excess(
        (n, m, terminating) in (1usize..10).prop_flat_map(|n| {
            (Just(n), 0..n, prop::collection::vec(any::<bool>(), n))
        })
    ) {
        let fixture = Fixture::new(10);
        let resolver = fixture.service_resolver();
        let tasks: Vec<Task> = accepted_tasks(n)
            .iter()
            .zip(&terminating)
            .map(|(task, killing)| {
                if *killing {
                    in_state(task, TaskState::KillInitiated, reason::SCALED_DOWN)
                } else {
                    started(task)
                }
            })
            .collect();
        let already = terminating.iter().filter(|t| **t).count();
        let desired = u32::try_from(m).unwrap();
        let tree = job_tree(&service_job(desired, 3), &tasks);

        let actions = resolver.resolve(&tree, &tree, &tree).unwrap();

        prop_assert_eq!(actions.len(), (n - m).saturating_sub(already));
        for action in &actions {
            let JobAction::InitiateTaskKill { task, .. } = action.kind() else {
                return Err(TestCaseError::fail(format!("unexpected {}", action.kind().name())));
            };
            prop_assert!(!task.is_terminating());
        }
    }

    /// Property: admissions in any window of W ms never exceed B + floor(W / I)
    #[test]
    fn prop_rate_limit_admissions_are_bounded(
        bucket_size in 1u64..6,
        refill_interval_ms in 1u64..50,
        steps in prop::collection::vec((0u64..40, any::<bool>()), 1..200),
    ) {
        let clock = Arc::new(TestClock::new(0));
        let limiter = RateLimiterInterceptor::new(
            "newTask",
            &RateLimitConfig { bucket_size, refill_interval_ms },
            clock.clone(),
        );

        let mut admitted = Vec::new();
        for (advance, take) in steps {
            clock.advance(advance);
            if take && limiter.try_take(JOB_ID) {
                admitted.push(clock.now_ms());
            }
        }

        for (i, start) in admitted.iter().enumerate() {
            for (j, end) in admitted.iter().enumerate().skip(i) {
                let count = (j - i + 1) as u64;
                let bound = bucket_size + (end - start) / refill_interval_ms;
                prop_assert!(count <= bound, "{} admissions in [{}, {}], bound {}", count, start, end, bound);
            }
        }
    }

    /// Property: backoff delays never shrink and never exceed the maximum
    #[test]
    fn prop_retry_backoff_is_monotonic(
        initial_delay_ms in 1u64..1_000,
        extra_ms in 0u64..60_000,
        multiplier in 1.0f64..4.0,
        attempts in 1u32..20,
    ) {
        let config = RetryConfig {
            initial_delay_ms,
            max_delay_ms: initial_delay_ms + extra_ms,
            multiplier,
        };
        let retry = RetryActionInterceptor::new("storeWrite", &config, Arc::new(TestClock::new(0)));
        let max = std::time::Duration::from_millis(config.max_delay_ms);

        let mut previous = retry.delay_for_attempt(1);
        prop_assert!(previous <= max);
        for attempt in 2..=attempts {
            let delay = retry.delay_for_attempt(attempt);
            prop_assert!(delay >= previous, "attempt {} shrank from {:?} to {:?}", attempt, previous, delay);
            prop_assert!(delay <= max);
            previous = delay;
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: N accepted tasks with a bucket of B converge within
    /// ceil(N / B) cycles when the bucket refills between cycles
    #[test]
    fn prop_new_tasks_converge_within_bucket_bound(n in 1usize..12, bucket_size in 1u64..5) {
        let fixture = Fixture::new(bucket_size);
        let desired = u32::try_from(n).unwrap();
        let job = service_job(desired, 3);
        let resolver: Arc<dyn DifferenceResolver<JobAction>> = Arc::new(fixture.service_resolver());
        let mut engine = ReconciliationEngine::new(
            job_tree(&job, &accepted_tasks(n)),
            job_tree(&job, &[]),
            job_tree(&job, &[]),
            resolver,
            Arc::new(fixture.context.clone()),
            EventSink::new(JOB_ID, 1024),
        )
        .unwrap();

        let bound = n.div_ceil(usize::try_from(bucket_size).unwrap());
        let settled = block_on(async {
            for _ in 0..bound {
                engine.run_cycle().await;
                fixture.clock.advance(bucket_size * 100);
            }
            engine.run_cycle().await.is_settled()
        });

        prop_assert_eq!(fixture.vm.launched().len(), n);
        prop_assert!(settled);
    }
}
