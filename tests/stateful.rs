//! Stateful message bus: deferred batching, exactly-once delivery and the
//! send limit.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use colombo::{ColomboBuilder, ColomboConfig, DispatchError, InterceptionPriority};
use colombo_testlib::{
    EventLog, GroupedRequest, HelloWorldHandler, HelloWorldRequest, Recorder, StubProcessor,
    init_tracing,
};
use tokio::time::timeout;

fn hello_bus(log: &EventLog, max_allowed_sends: usize) -> anyhow::Result<colombo::Colombo> {
    let mut config = ColomboConfig::default();
    config.stateful.max_allowed_sends = max_allowed_sends;
    Ok(ColomboBuilder::new()
        .with_config(config)
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .send_interceptor(Recorder::new("send", InterceptionPriority::LOWEST, log))
        .build()?)
}

#[tokio::test]
async fn requests_go_out_together_on_first_await() -> anyhow::Result<()> {
    init_tracing();
    let log = EventLog::new();
    let colombo = hello_bus(&log, 1)?;
    let stateful = colombo.stateful();

    let foo = stateful.future_send(HelloWorldRequest::new("Foo"));
    let bar = stateful.future_send(HelloWorldRequest::new("Bar"));
    assert_eq!(stateful.unsent(), 2);
    assert_eq!(stateful.sends(), 0);
    assert!(log.snapshot().is_empty());

    let foo_id = foo.correlation_id();
    let foo = foo.await?;
    assert_eq!(foo.message, "Hello, Foo!");
    assert_eq!(foo.header.correlation_id(), Some(foo_id));
    assert_eq!(stateful.sends(), 1);
    assert_eq!(stateful.unsent(), 0);

    assert_eq!(bar.await?.message, "Hello, Bar!");
    assert_eq!(log.snapshot(), vec!["send:before", "send:after"]);
    Ok(())
}

#[tokio::test]
async fn callback_registered_before_arrival_runs_once() -> anyhow::Result<()> {
    let log = EventLog::new();
    let colombo = hello_bus(&log, 1)?;
    let stateful = colombo.stateful();

    let events = EventLog::new();
    let on_success = events.clone();
    let on_error = events.clone();
    stateful.future_send(HelloWorldRequest::new("Foo")).on_complete(
        move |response| on_success.push(response.message),
        move |error| on_error.push(format!("error: {error}")),
    );
    assert!(events.snapshot().is_empty());

    stateful.flush().await?;
    stateful.flush().await?;
    assert_eq!(events.snapshot(), vec!["Hello, Foo!"]);
    assert_eq!(stateful.sends(), 1);
    Ok(())
}

#[tokio::test]
async fn callback_registered_after_arrival_runs_immediately() -> anyhow::Result<()> {
    let log = EventLog::new();
    let colombo = hello_bus(&log, 1)?;
    let stateful = colombo.stateful();

    let future = stateful.future_send(HelloWorldRequest::new("Foo"));
    stateful.flush().await?;

    let events = EventLog::new();
    let on_success = events.clone();
    let on_error = events.clone();
    future.on_complete(
        move |response| on_success.push(response.message),
        move |error| on_error.push(format!("error: {error}")),
    );
    assert_eq!(events.snapshot(), vec!["Hello, Foo!"]);
    Ok(())
}

#[tokio::test]
async fn sends_beyond_the_limit_are_refused() -> anyhow::Result<()> {
    let log = EventLog::new();
    let colombo = hello_bus(&log, 1)?;
    let stateful = colombo.stateful();
    assert_eq!(stateful.max_allowed_sends(), 1);

    stateful.future_send(HelloWorldRequest::new("first")).await?;

    let late = stateful.future_send(HelloWorldRequest::new("late"));
    let error = late.await.unwrap_err();
    assert_matches!(error.failures().as_slice(), [DispatchError::SendLimitExceeded { limit: 1 }]);
    assert_eq!(stateful.sends(), 1);
    assert_eq!(log.snapshot(), vec!["send:before", "send:after"]);
    Ok(())
}

#[tokio::test]
async fn higher_limit_allows_more_batches() -> anyhow::Result<()> {
    let log = EventLog::new();
    let colombo = hello_bus(&log, 2)?;
    let stateful = colombo.stateful();

    stateful.future_send(HelloWorldRequest::new("one")).await?;
    stateful.future_send(HelloWorldRequest::new("two")).await?;
    assert_eq!(stateful.sends(), 2);

    let refused = stateful.future_send(HelloWorldRequest::new("three"));
    assert_matches!(stateful.flush().await, Err(DispatchError::Shared(_)));
    assert!(refused.await.is_err());
    Ok(())
}

#[tokio::test]
async fn batch_failure_reaches_every_request() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .processor(StubProcessor::for_group("ledger", "ledger").failing("ledger offline"))
        .build()?;
    let stateful = colombo.stateful();

    let debit = stateful.future_send(GroupedRequest::new("ledger"));
    let credit = stateful.future_send(GroupedRequest::new("ledger"));

    let debit = debit.await.unwrap_err();
    let credit = credit.await.unwrap_err();
    let (DispatchError::Shared(debit), DispatchError::Shared(credit)) = (debit, credit) else {
        panic!("expected shared failures");
    };
    assert!(Arc::ptr_eq(&debit, &credit));
    assert_matches!(*debit, DispatchError::Processor { .. });
    Ok(())
}

#[tokio::test]
async fn cancelled_caller_does_not_strand_the_batch() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .processor(StubProcessor::for_group("slow", "slow").with_delay(Duration::from_millis(100)))
        .build()?;
    let stateful = colombo.stateful();

    let first = stateful.future_send(GroupedRequest::new("slow"));
    let second = stateful.future_send(GroupedRequest::new("slow"));

    // Gives up while the batch it triggered is still in flight.
    assert!(timeout(Duration::from_millis(10), first.get()).await.is_err());

    let second = timeout(Duration::from_secs(2), second.get()).await?;
    assert!(second.is_ok());
    assert_eq!(stateful.sends(), 1);
    assert_eq!(stateful.outstanding(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn callback_races_arrival_and_runs_once() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .build()?;

    for _ in 0..200 {
        let stateful = colombo.stateful();
        let future = stateful.future_send(HelloWorldRequest::new("Foo"));
        let calls = Arc::new(AtomicUsize::new(0));

        let flusher = tokio::spawn({
            let stateful = stateful.clone();
            async move { stateful.flush().await }
        });
        let registrar = tokio::spawn({
            let on_success = calls.clone();
            let on_error = calls.clone();
            async move {
                future.on_complete(
                    move |_| {
                        on_success.fetch_add(1, Ordering::SeqCst);
                    },
                    move |_| {
                        on_error.fetch_add(100, Ordering::SeqCst);
                    },
                );
            }
        });

        flusher.await??;
        registrar.await?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stateful.outstanding(), 0);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gets_share_one_batch() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .build()?;

    for _ in 0..100 {
        let stateful = colombo.stateful();
        let foo = stateful.future_send(HelloWorldRequest::new("Foo"));
        let bar = stateful.future_send(HelloWorldRequest::new("Bar"));

        let foo = tokio::spawn(foo.get());
        let bar = tokio::spawn(bar.get());
        assert_eq!(foo.await??.message, "Hello, Foo!");
        assert_eq!(bar.await??.message, "Hello, Bar!");
        assert_eq!(stateful.sends(), 1);
    }
    Ok(())
}

#[tokio::test]
async fn dropped_futures_leave_nothing_behind() -> anyhow::Result<()> {
    let log = EventLog::new();
    let colombo = hello_bus(&log, 2)?;
    let stateful = colombo.stateful();

    // Dropped after the result arrived.
    let answered = stateful.future_send(HelloWorldRequest::new("Foo"));
    stateful.flush().await?;
    assert_eq!(stateful.outstanding(), 1);
    drop(answered);
    assert_eq!(stateful.outstanding(), 0);

    // Dropped before the send; the request still goes out.
    drop(stateful.future_send(HelloWorldRequest::new("Bar")));
    assert_eq!(stateful.outstanding(), 0);
    assert_eq!(stateful.unsent(), 1);
    stateful.flush().await?;
    assert_eq!(stateful.sends(), 2);
    assert_eq!(stateful.outstanding(), 0);
    Ok(())
}
