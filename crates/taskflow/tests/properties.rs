//! End-to-end behavior of pools, pipelines and deadlines.
//!
//! Every test drives the public API only: tasks go in through a queue or a
//! pipeline submitter, results come out through the consumption interface.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use taskflow::{
    BoundedQueue, DeadlineController, EngineConfig, ErrorInfo, ErrorKind, Pipeline,
    PipelineBuilder, RecordingDropSink, ShutdownCoordinator, Task, TaskError, TaskFailure,
    TaskResult, WorkerPool,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn config(workers: usize, capacity: usize) -> EngineConfig {
    EngineConfig::default()
        .with_workers(workers)
        .with_queue_capacity(capacity)
}

async fn drain<O>(output: &BoundedQueue<TaskResult<O>>) -> Vec<TaskResult<O>> {
    let mut results = Vec::new();
    while let Some(result) = output.take().await {
        results.push(result);
    }
    results
}

mod processing_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_each_task_id_appears_in_exactly_one_result() {
        init_tracing();
        let mut pipeline = Pipeline::single(config(8, 4), |task: Task<u64>| async move {
            tokio::task::yield_now().await;
            Ok::<_, TaskError>(*task.payload())
        })
        .unwrap();

        let producer = tokio::spawn({
            let submitter = pipeline.submitter();
            async move {
                for n in 0..500 {
                    submitter.submit(n).await.unwrap();
                }
                submitter.close();
            }
        });

        let results = pipeline.await_all(Duration::from_secs(30)).await.unwrap();
        producer.await.unwrap();

        let ids: HashSet<_> = results.iter().map(|r| r.task_id()).collect();
        assert_eq!(results.len(), 500);
        assert_eq!(ids.len(), 500, "no duplicate results");
        assert_eq!(ids, (1..=500).collect::<HashSet<_>>());
    }

    #[tokio::test]
    async fn test_no_lost_work_through_rendezvous_queues() {
        let mut pipeline = PipelineBuilder::new(config(3, 0))
            .stage(3, |task: Task<u32>| async move { Ok::<_, TaskError>(task.payload() + 1) })
            .stage(2, |task: Task<u32>| async move { Ok::<_, TaskError>(task.payload() * 3) })
            .build()
            .unwrap();

        let submitter = pipeline.submitter();
        let producer = tokio::spawn(async move {
            for n in 0..40 {
                submitter.submit(n).await.unwrap();
            }
            submitter.close();
        });

        let results = pipeline.await_all(Duration::from_secs(10)).await.unwrap();
        producer.await.unwrap();
        assert_eq!(results.len(), 40);
        assert!(results.iter().all(|r| r.is_ok()));

        let report = pipeline.shutdown().await;
        assert_eq!(report.stages[0].completed, 40);
        assert_eq!(report.stages[1].completed, 40);
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test]
    async fn test_panicking_task_is_isolated() {
        init_tracing();
        let mut pipeline = Pipeline::single(config(1, 8), |task: Task<u32>| async move {
            if *task.payload() == 2 {
                let empty: Vec<u32> = Vec::new();
                return Ok::<_, TaskError>(empty[*task.payload() as usize]);
            }
            Ok(*task.payload())
        })
        .unwrap();
        for n in 1..=4 {
            pipeline.submit(n).await.unwrap();
        }
        pipeline.submit_and_close();

        let mut results = pipeline.await_all(Duration::from_secs(5)).await.unwrap();
        results.sort_by_key(|r| r.task_id());
        assert_eq!(results.len(), 4);

        let fault = results[1].err().unwrap();
        assert_eq!(fault.kind(), ErrorKind::Unclassified);
        assert!(fault.description().contains("index out of bounds"));
        assert!(fault.trace().is_some());
        for result in [&results[0], &results[2], &results[3]] {
            assert!(result.is_ok(), "task {} still completed", result.task_id());
        }
    }

    #[tokio::test]
    async fn test_classified_failures_are_ordinary_results() {
        let mut pipeline = Pipeline::single(config(2, 8), |task: Task<u32>| async move {
            match task.payload() {
                0 => Err(TaskError::from(TaskFailure::validation("payload", "zero"))),
                1 => Err(TaskError::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "db unreachable",
                ))),
                2 => Err(TaskError::from(ErrorInfo::timeout(Duration::from_millis(5)))),
                n => Ok(*n),
            }
        })
        .unwrap();
        for n in 0..4 {
            pipeline.submit(n).await.unwrap();
        }
        pipeline.submit_and_close();

        let mut results = pipeline.await_all(Duration::from_secs(5)).await.unwrap();
        results.sort_by_key(|r| r.task_id());
        let kinds: Vec<_> = results.iter().map(|r| r.error_kind()).collect();
        assert_eq!(
            kinds,
            vec![
                Some(ErrorKind::Validation),
                Some(ErrorKind::Resource),
                Some(ErrorKind::Timeout),
                None
            ]
        );
        assert!(results[1].err().unwrap().is_retryable());
        assert!(!results[0].err().unwrap().is_retryable());
    }
}

mod shutdown_tests {
    use super::*;

    #[tokio::test]
    async fn test_end_of_stream_only_after_every_result() {
        let input = BoundedQueue::new(8);
        let output = BoundedQueue::new(8);
        let pool = WorkerPool::builder(input.clone(), output.clone())
            .workers(2)
            .spawn(|task: Task<u32>| async move {
                if *task.payload() == 3 {
                    return Err(TaskError::from("task 3 always fails"));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(*task.payload())
            })
            .unwrap();

        for id in 1..=5u64 {
            input.put(Task::new(id, id as u32)).await.unwrap();
        }
        input.close();

        let mut received = Vec::new();
        while let Some(result) = output.take().await {
            if output.is_closed() && output.is_empty() {
                assert_eq!(received.len(), 4, "closed before the last result was taken");
            }
            received.push(result);
        }
        assert_eq!(received.len(), 5);
        assert_eq!(received.iter().filter(|r| !r.is_ok()).count(), 1);
        assert!(output.is_closed());
        assert!(output.take().await.is_none(), "end-of-stream is sticky");

        let report = pool.join().await;
        assert_eq!(report.completed, 4);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_fan_out_and_fan_in_share_queues() {
        let input = BoundedQueue::new(4);
        let output = BoundedQueue::new(4);
        let coordinator = ShutdownCoordinator::new("merge", output.clone());

        let pools: Vec<_> = ["fast", "slow"]
            .into_iter()
            .map(|name| {
                WorkerPool::builder(input.clone(), output.clone())
                    .name(name)
                    .workers(2)
                    .spawn_joined(&coordinator, |task: Task<u64>| async move {
                        tokio::task::yield_now().await;
                        Ok::<_, TaskError>(*task.payload())
                    })
                    .unwrap()
            })
            .collect();
        coordinator.seal();

        let producers: Vec<_> = (0..3u64)
            .map(|p| {
                let input = input.clone();
                tokio::spawn(async move {
                    for i in 0..10 {
                        let id = p * 10 + i + 1;
                        input.put(Task::new(id, id)).await.unwrap();
                    }
                })
            })
            .collect();

        let consumer = tokio::spawn({
            let output = output.clone();
            async move { drain(&output).await }
        });
        for producer in producers {
            producer.await.unwrap();
        }
        input.close();

        let results = consumer.await.unwrap();
        let ids: HashSet<_> = results.iter().map(|r| r.task_id()).collect();
        assert_eq!(results.len(), 30);
        assert_eq!(ids, (1..=30).collect::<HashSet<_>>());

        let mut processed = 0;
        for pool in pools {
            processed += pool.join().await.processed();
        }
        assert_eq!(processed, 30);
    }
}

mod cancellation_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_drains_queued_tasks_as_cancelled() {
        init_tracing();
        let input = BoundedQueue::new(16);
        let output = BoundedQueue::new(16);
        let controller = DeadlineController::new(Duration::from_millis(100));
        let pool = WorkerPool::builder(input.clone(), output.clone())
            .workers(1)
            .cancellation(controller.token().clone())
            .spawn(|task: Task<u64>| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, TaskError>(*task.payload())
            })
            .unwrap();

        for id in 1..=10 {
            input.put(Task::new(id, id)).await.unwrap();
        }

        // The producer owns the input and closes it once cancelled.
        tokio::spawn({
            let input = input.clone();
            let token = controller.token().clone();
            async move {
                token.cancelled().await;
                input.close();
            }
        });

        let waited = controller.run(pool.closed()).await;
        assert!(matches!(waited, Err(ErrorInfo::Timeout { .. })));
        assert!(controller.token().is_cancelled());

        let mut results = drain(&output).await;
        results.sort_by_key(|r| r.task_id());
        assert_eq!(results.len(), 10);
        assert_eq!(results[0].output(), Some(&1), "in-flight task completes");
        for result in &results[1..] {
            assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
        }

        let report = pool.join().await;
        assert_eq!(report.completed, 1);
        assert_eq!(report.cancelled, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_downstream_stage_outlasts_slow_upstream_after_deadline() {
        init_tracing();
        let sink = Arc::new(RecordingDropSink::new());
        let config = config(1, 16)
            .with_deadline(Duration::from_millis(100))
            .with_drain_timeout(Duration::from_millis(50));
        let mut pipeline = PipelineBuilder::new(config)
            .drop_sink(sink.clone())
            .stage(1, |task: Task<u64>| async move {
                // Still running long after both the deadline and the drain timeout.
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, TaskError>(*task.payload())
            })
            .stage(1, |task: Task<u64>| async move { Ok::<_, TaskError>(task.payload() + 1) })
            .build()
            .unwrap();
        for n in 1..=3 {
            pipeline.submit(n).await.unwrap();
        }

        let mut results: Vec<_> = futures::StreamExt::collect(pipeline.results()).await;
        results.sort_by_key(|r| r.task_id());
        assert_eq!(results.len(), 3);
        assert!(sink.is_empty());
        for result in &results {
            assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
        }

        let report = pipeline.shutdown().await;
        assert!(report.deadline_expired);
        assert_eq!(report.abandoned, 0);
        assert_eq!(report.stages[0].completed, 1);
        assert_eq!(report.stages[0].cancelled, 2);
        assert_eq!(report.stages[1].cancelled, 1);
        assert_eq!(report.stages[1].forwarded, 2);
        assert_eq!(report.totals().dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_deadline_cancels_every_stage() {
        let config = config(1, 16).with_deadline(Duration::from_millis(100));
        let mut pipeline = PipelineBuilder::new(config)
            .stage(1, |task: Task<u64>| async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok::<_, TaskError>(*task.payload())
            })
            .stage(1, |task: Task<u64>| async move { Ok::<_, TaskError>(task.payload() + 100) })
            .build()
            .unwrap();
        for n in 1..=6 {
            pipeline.submit(n).await.unwrap();
        }

        let results: Vec<_> = futures::StreamExt::collect(pipeline.results()).await;
        assert_eq!(results.len(), 6);
        // Task 1 clears both stages before the deadline. Task 2 finishes
        // stage 1 after it, so stage 2 never starts it.
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

        let report = pipeline.shutdown().await;
        assert!(report.deadline_expired);
        assert_eq!(report.stages[0].completed, 2);
        assert_eq!(report.stages[0].cancelled, 4);
        assert_eq!(report.stages[1].completed, 1);
        assert_eq!(report.stages[1].cancelled, 1);
        assert_eq!(report.stages[1].forwarded, 4);
        assert_eq!(report.totals().dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_results_never_silently_lost() {
        let sink = Arc::new(RecordingDropSink::new());
        let config = config(2, 1).with_drain_timeout(Duration::from_millis(50));
        let pipeline = PipelineBuilder::new(config)
            .drop_sink(sink.clone())
            .stage(2, |task: Task<u64>| async move { Ok::<_, TaskError>(*task.payload()) })
            .build()
            .unwrap();
        let submitter = pipeline.submitter();
        tokio::spawn(async move {
            let mut n = 0;
            while submitter.submit(n).await.is_ok() {
                n += 1;
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        pipeline.cancel();

        let report = pipeline.shutdown().await;
        let totals = report.totals();
        assert_eq!(
            totals.delivered(),
            report.abandoned,
            "every delivered result was drained at shutdown"
        );
        assert_eq!(sink.len(), totals.dropped + report.abandoned);
    }
}

mod composition_tests {
    use super::*;

    async fn run(mut pipeline: Pipeline<u64, u64>) -> Vec<u64> {
        for n in 1..=5 {
            pipeline.submit(n).await.unwrap();
        }
        pipeline.submit_and_close();
        let mut outputs: Vec<_> = pipeline
            .await_all(Duration::from_secs(5))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|r| r.into_outcome().ok())
            .collect();
        outputs.sort();
        outputs
    }

    #[tokio::test]
    async fn test_filter_even_then_double() {
        let pipeline = PipelineBuilder::new(config(2, 4))
            .filter(2, |n: &u64| n % 2 == 0)
            .stage(2, |task: Task<u64>| async move { Ok::<_, TaskError>(task.payload() * 2) })
            .build()
            .unwrap();
        assert_eq!(run(pipeline).await, vec![4, 8]);
    }

    #[tokio::test]
    async fn test_double_then_filter_even_keeps_everything() {
        let pipeline = PipelineBuilder::new(config(2, 4))
            .stage(2, |task: Task<u64>| async move { Ok::<_, TaskError>(task.payload() * 2) })
            .filter(2, |n: &u64| n % 2 == 0)
            .build()
            .unwrap();
        assert_eq!(run(pipeline).await, vec![2, 4, 6, 8, 10]);
    }
}
