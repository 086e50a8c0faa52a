//! Handler resolution by context and handler lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use assert_matches::assert_matches;
use colombo::{
    ChooseWhen, ColomboBuilder, DispatchError, FnFactory, HandleContext, HandlerFactory, Request,
    RequestHandler,
};
use colombo_testlib::{
    GermanHelloWorldHandler, HelloWorldHandler, HelloWorldRequest, HelloWorldResponse,
    init_tracing,
};
use expect_test::expect;

#[tokio::test]
async fn specialized_handler_wins_when_its_context_matches() -> anyhow::Result<()> {
    init_tracing();
    let colombo = ColomboBuilder::new()
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .request_handler_when::<HelloWorldRequest, _>(
            GermanHelloWorldHandler,
            GermanHelloWorldHandler::choose_when(),
        )
        .build()?;

    let german = HelloWorldRequest::new("Foo").with_culture("de-DE");
    assert_eq!(colombo.bus().send(german).await?.message, "Hallo, Foo!");

    let french = HelloWorldRequest::new("Foo").with_culture("fr-FR");
    assert_eq!(colombo.bus().send(french).await?.message, "Hello, Foo!");

    let plain = HelloWorldRequest::new("Foo");
    assert_eq!(colombo.bus().send(plain).await?.message, "Hello, Foo!");
    Ok(())
}

#[tokio::test]
async fn two_defaults_are_ambiguous() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .request_handler::<HelloWorldRequest, _>(GermanHelloWorldHandler)
        .build()?;

    let error = colombo.bus().send(HelloWorldRequest::new("Foo")).await.unwrap_err();
    assert!(error.is_configuration_error());
    expect![[r#"ambiguous handlers for HelloWorldRequest; candidates considered: [HelloWorldHandler, GermanHelloWorldHandler]"#]]
        .assert_eq(&error.to_string());
    Ok(())
}

#[tokio::test]
async fn two_matching_specializations_are_ambiguous() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .request_handler_when::<HelloWorldRequest, _>(
            HelloWorldHandler,
            ChooseWhen::context_has("culture"),
        )
        .request_handler_when::<HelloWorldRequest, _>(
            GermanHelloWorldHandler,
            GermanHelloWorldHandler::choose_when(),
        )
        .build()?;

    let error = colombo
        .bus()
        .send(HelloWorldRequest::new("Foo").with_culture("de-DE"))
        .await
        .unwrap_err();
    assert_matches!(error, DispatchError::AmbiguousHandler { candidates, .. } if candidates.len() == 2);
    Ok(())
}

#[tokio::test]
async fn no_surviving_handler_lists_the_candidates() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .request_handler_when::<HelloWorldRequest, _>(
            GermanHelloWorldHandler,
            GermanHelloWorldHandler::choose_when(),
        )
        .build()?;

    let error = colombo.bus().send(HelloWorldRequest::new("Foo")).await.unwrap_err();
    expect![[r#"no handler found for HelloWorldRequest; candidates considered: [GermanHelloWorldHandler (when culture=de-DE)]"#]]
        .assert_eq(&error.to_string());
    Ok(())
}

#[tokio::test]
async fn handle_dispatcher_stamps_the_correlation_id() -> anyhow::Result<()> {
    let colombo = ColomboBuilder::new()
        .request_handler::<HelloWorldRequest, _>(HelloWorldHandler)
        .build()?;

    let request = HelloWorldRequest::new("Direct");
    let correlation_id = request.correlation_id();
    let response = colombo.handle_dispatcher().handle_typed(request).await?;

    assert_eq!(response.message, "Hello, Direct!");
    assert_eq!(response.header.correlation_id(), Some(correlation_id));
    Ok(())
}

/// Counts its instances and fails on request.
struct Flaky {
    fail: bool,
}

impl RequestHandler<HelloWorldRequest> for Flaky {
    async fn handle(
        &self,
        request: &HelloWorldRequest,
        cx: &HandleContext<'_>,
    ) -> anyhow::Result<HelloWorldResponse> {
        if self.fail {
            anyhow::bail!("{} refused {}", cx.handler_name(), request.name);
        }
        Ok(HelloWorldResponse {
            message: "ok".to_string(),
            ..HelloWorldResponse::default()
        })
    }
}

#[derive(Clone, Default)]
struct Lifecycle {
    created: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

struct FlakyFactory {
    fail: bool,
    lifecycle: Lifecycle,
}

impl HandlerFactory for FlakyFactory {
    type Handler = Flaky;

    fn create(&self) -> anyhow::Result<Flaky> {
        self.lifecycle.created.fetch_add(1, Ordering::SeqCst);
        Ok(Flaky { fail: self.fail })
    }

    fn release(&self, _handler: Flaky) {
        self.lifecycle.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn instances_are_released_after_success_and_failure() -> anyhow::Result<()> {
    for fail in [false, true] {
        let lifecycle = Lifecycle::default();
        let colombo = ColomboBuilder::new()
            .request_handler_factory::<HelloWorldRequest, _>(
                FlakyFactory {
                    fail,
                    lifecycle: lifecycle.clone(),
                },
                None,
            )
            .build()?;

        let result = colombo.bus().send(HelloWorldRequest::new("Foo")).await;
        if fail {
            assert_matches!(
                result,
                Err(DispatchError::Handler { handler, request_type, .. })
                    if handler == "Flaky" && request_type == "HelloWorldRequest"
            );
        } else {
            assert_eq!(result?.message, "ok");
        }
        assert_eq!(lifecycle.created.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.released.load(Ordering::SeqCst), 1);
    }
    Ok(())
}

#[tokio::test]
async fn fn_factory_creates_an_instance_per_call() -> anyhow::Result<()> {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let colombo = ColomboBuilder::new()
        .request_handler_factory::<HelloWorldRequest, _>(
            FnFactory::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                HelloWorldHandler
            }),
            None,
        )
        .build()?;

    let mut batch = colombo.bus().batch();
    for name in ["a", "b", "c"] {
        batch.add(HelloWorldRequest::new(name));
    }
    batch.send().await?;

    assert_eq!(created.load(Ordering::SeqCst), 3);
    Ok(())
}
