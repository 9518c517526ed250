mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{ready_controller, test_config, ScriptRuntime};
use nagini::{Controller, Error, InitOptions, InputResponder, Lifecycle, Namespace, PendingOperation};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;

fn namespace(value: serde_json::Value) -> Namespace {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Namespace::new(),
    }
}

#[tokio::test]
async fn globals_persist_between_executions() -> Result<()> {
    let controller = ready_controller().await?;
    assert!(controller.is_ready());

    let first = controller.execute_async("a.py", "greeting = \"hi\"", None).await?;
    assert!(first.succeeded());
    let second = controller.execute_async("b.py", "print(greeting + \"!\")", None).await?;
    assert_eq!(second.stdout, "hi!\n");
    assert!(!second.executed_with_namespace);

    controller.destroy().await;
    Ok(())
}

#[tokio::test]
async fn namespace_overrides_are_scoped_to_one_execution() -> Result<()> {
    let controller = ready_controller().await?;
    controller.execute_async("setup.py", "x = \"global\"", None).await?;

    let scoped = controller
        .execute_async("scoped.py", "print(x + y)\nkept = \"yes\"", Some(namespace(json!({ "x": "local", "y": "temp" }))))
        .await?;
    assert_eq!(scoped.stdout, "localtemp\n");
    assert!(scoped.executed_with_namespace);

    let after = controller.execute_async("after.py", "print(x)", None).await?;
    assert_eq!(after.stdout, "global\n");

    let kept = controller.execute_async("kept.py", "print(kept)", None).await?;
    assert_eq!(kept.error.map(|e| e.kind), Some("NameError".to_string()));

    let missing = controller.execute_async("missing.py", "print(y)", None).await?;
    let error = missing.error.expect("y should be unbound again");
    assert_eq!(error.kind, "NameError");
    Ok(())
}

#[tokio::test]
async fn namespace_is_restored_when_code_raises() -> Result<()> {
    let controller = ready_controller().await?;
    controller.execute_async("setup.py", "x = \"global\"", None).await?;

    let failed = controller
        .execute_async("boom.py", "print(x)\nraise ValueError(\"boom\")", Some(namespace(json!({ "x": "local" }))))
        .await?;
    assert_eq!(failed.stdout, "local\n");
    assert_eq!(failed.error.as_ref().map(|e| e.kind.as_str()), Some("ValueError"));
    assert_eq!(failed.error.as_ref().map(|e| e.message.as_str()), Some("boom"));

    let after = controller.execute_async("after.py", "print(x)", None).await?;
    assert_eq!(after.stdout, "global\n");
    Ok(())
}

#[tokio::test]
async fn bindings_made_under_overrides_do_not_leak() -> Result<()> {
    let controller = ready_controller().await?;
    let scoped = controller
        .execute_async("s.py", "y = x + 41\nraise ValueError(\"late\")", Some(namespace(json!({ "x": 1 }))))
        .await?;
    assert_eq!(scoped.error.map(|e| e.kind), Some("ValueError".to_string()));

    let after = controller.execute_async("a.py", "print(y)", None).await?;
    assert_eq!(after.error.map(|e| e.kind), Some("NameError".to_string()));
    let after = controller.execute_async("b.py", "print(x)", None).await?;
    assert_eq!(after.error.map(|e| e.kind), Some("NameError".to_string()));
    Ok(())
}

#[tokio::test]
async fn missive_is_returned_once_per_execution() -> Result<()> {
    let controller = ready_controller().await?;

    let sent = controller.execute_async("m.py", "missive({\"answer\": 42})", None).await?;
    assert_eq!(sent.missive, Some(json!({ "answer": 42 })));

    let twice = controller.execute_async("m2.py", "missive(1)\nmissive(2)", None).await?;
    let error = twice.error.expect("second missive must fail");
    assert_eq!(error.kind, "ValueError");
    assert!(error.message.contains("only be called once"));

    let quiet = controller.execute_async("m3.py", "print(\"no missive\")", None).await?;
    assert_eq!(quiet.missive, None);
    Ok(())
}

#[tokio::test]
async fn runtime_errors_are_part_of_the_result() -> Result<()> {
    let controller = ready_controller().await?;
    let result = controller.execute_async("calc.py", "print(\"before\")\nx = 1 / 0", None).await?;
    assert!(!result.succeeded());
    assert_eq!(result.stdout, "before\n");
    let error = result.error.expect("division by zero");
    assert_eq!(error.kind, "ZeroDivisionError");
    assert!(result.stderr.contains("File \"calc.py\", line 2"));
    Ok(())
}

#[tokio::test]
async fn queued_inputs_are_consumed_in_order() -> Result<()> {
    let controller = ready_controller().await?;
    controller.queue_input("Ada");
    controller.queue_input("42");
    assert_eq!(controller.queued_inputs(), 2);

    let result = controller
        .execute_async("ask.py", "name = input(\"Name: \")\nage = input(\"Age: \")\nprint(name + age)", None)
        .await?;
    assert_eq!(result.error, None);
    assert_eq!(result.stdout, "Name: Age: Ada42\n");
    assert_eq!(controller.queued_inputs(), 0);
    assert!(!controller.is_waiting_for_input());
    Ok(())
}

#[tokio::test]
async fn callback_answers_input_requests() -> Result<()> {
    let controller = ready_controller().await?;
    controller.set_input_callback(|request| {
        let answer = format!("cb:{}", request.prompt.trim());
        let _ = request.respond(answer);
    });

    let result = controller.execute_async("ask.py", "print(input(\"Q?\"))", None).await?;
    assert_eq!(result.stdout, "Q?cb:Q?\n");

    // Queued values win over the callback.
    controller.queue_input("queued");
    let result = controller.execute_async("ask.py", "print(input(\"Q?\"))", None).await?;
    assert_eq!(result.stdout, "Q?queued\n");

    controller.clear_input_callback();
    Ok(())
}

#[tokio::test]
async fn unanswered_input_falls_back_to_empty_string() -> Result<()> {
    let controller = ready_controller().await?;
    let result = controller
        .execute_async("ask.py", "name = input(\"Name: \")\nprint(\"Hello \" + name)", None)
        .await?;
    assert_eq!(result.error, None);
    assert_eq!(result.stdout, "Name: Hello \n");
    Ok(())
}

#[tokio::test]
async fn execution_suspends_until_input_is_provided() -> Result<()> {
    let controller = Arc::new(ready_controller().await?);
    let slot: Arc<Mutex<Option<InputResponder>>> = Arc::new(Mutex::new(None));
    let asked = Arc::new(Notify::new());
    {
        let slot = Arc::clone(&slot);
        let asked = Arc::clone(&asked);
        controller.set_input_callback(move |request| {
            *slot.lock() = Some(request.into_responder());
            asked.notify_one();
        });
    }

    let running = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.execute_async("wait.py", "who = input(\"Who? \")\nprint(who)", None).await })
    };

    tokio::time::timeout(Duration::from_secs(2), asked.notified()).await?;
    assert!(controller.is_waiting_for_input());
    assert_eq!(controller.current_prompt().as_deref(), Some("Who? "));
    let state = controller.state();
    assert_eq!(state.pending, PendingOperation::AwaitingInput);
    assert_eq!(state.lifecycle, Lifecycle::Ready);

    let responder = slot.lock().take().expect("responder captured");
    responder.respond("Zed")?;

    let result = running.await??;
    assert_eq!(result.stdout, "Who? Zed\n");
    assert_eq!(controller.state().pending, PendingOperation::None);
    Ok(())
}

#[tokio::test]
async fn provide_input_without_a_request_fails() -> Result<()> {
    let controller = ready_controller().await?;
    assert!(matches!(controller.provide_input("x"), Err(Error::NoPendingInput)));
    Ok(())
}

#[tokio::test]
async fn calls_before_ready_are_rejected() -> Result<()> {
    let controller = Controller::new(ScriptRuntime::new(), InitOptions::new(), test_config())?;
    let err = controller.execute_async("early.py", "print(1)", None).await.unwrap_err();
    assert!(matches!(err, Error::NotReady("initializing")), "{err}");
    assert!(controller.read_file("x.txt").await.is_err());

    controller.wait_ready().await?;
    let result = controller.execute_async("late.py", "print(1)", None).await?;
    assert_eq!(result.stdout, "1\n");
    Ok(())
}

#[tokio::test]
async fn init_failure_is_reported() -> Result<()> {
    let runtime = ScriptRuntime { fail_start: Some("no interpreter".into()), ..ScriptRuntime::new() };
    let err = match Controller::start(runtime, InitOptions::new(), test_config()).await {
        Ok(_) => panic!("start should fail"),
        Err(err) => err,
    };
    match err {
        Error::Initialization(message) => {
            assert!(message.contains("Failed to initialize runtime"));
            assert!(message.contains("no interpreter"));
        }
        other => panic!("unexpected error {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn package_failures_do_not_block_readiness() -> Result<()> {
    let runtime = ScriptRuntime { fail_packages: Some("no module named numpy".into()), ..ScriptRuntime::new() };
    let controller = Controller::start(runtime, InitOptions::new().package("numpy"), test_config()).await?;
    assert!(controller.is_ready());
    Ok(())
}

#[tokio::test]
async fn second_request_while_busy_is_rejected() -> Result<()> {
    let controller = Arc::new(ready_controller().await?);
    let running = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.execute_async("slow.py", "sleep(300)\nprint(\"done\")", None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = controller.execute_async("fast.py", "print(1)", None).await.unwrap_err();
    assert!(matches!(err, Error::Busy { pending: "execution" }), "{err}");
    let err = controller.exists("a.txt").await.unwrap_err();
    assert!(matches!(err, Error::Busy { .. }), "{err}");

    let result = running.await??;
    assert_eq!(result.stdout, "done\n");
    Ok(())
}

#[tokio::test]
async fn timed_out_call_releases_the_context() -> Result<()> {
    let mut config = test_config();
    config.execution_timeout = Duration::from_millis(400);
    let controller = Controller::start(ScriptRuntime::new(), InitOptions::new(), config).await?;

    let err = controller.execute_async("slow.py", "sleep(600)\nprint(\"late\")", None).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { operation: "execution", .. }), "{err}");
    assert_eq!(controller.state().pending, PendingOperation::None);

    // The late result must not be mistaken for this call's reply.
    let next = controller.execute_async("next.py", "print(\"next\")", None).await?;
    assert_eq!(next.filename, "next.py");
    assert_eq!(next.stdout, "next\n");

    let history = controller.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].filename, "slow.py");
    assert_eq!(history[0].stdout, "late\n");
    Ok(())
}

#[tokio::test]
async fn history_records_every_result() -> Result<()> {
    let controller = ready_controller().await?;
    controller.execute_async("one.py", "print(1)", None).await?;
    controller.execute_async("two.py", "raise KeyError(\"k\")", None).await?;

    let history = controller.history();
    assert_eq!(history.len(), 2);
    assert!(history[0].succeeded());
    assert!(!history[1].succeeded());
    assert_eq!(controller.last_result().map(|r| r.filename), Some("two.py".to_string()));

    controller.clear_history();
    assert!(controller.history().is_empty());
    Ok(())
}

#[tokio::test]
async fn fire_and_forget_results_reach_history() -> Result<()> {
    let controller = ready_controller().await?;
    controller.execute_file("bg.py", "print(\"bg\")")?;
    assert_eq!(controller.state().pending, PendingOperation::Executing);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while controller.history().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "result never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(controller.history()[0].stdout, "bg\n");
    assert_eq!(controller.state().pending, PendingOperation::None);
    Ok(())
}

#[tokio::test]
async fn destroyed_controller_rejects_calls() -> Result<()> {
    let controller = ready_controller().await?;
    controller.destroy().await;
    assert_eq!(controller.state().lifecycle, Lifecycle::Destroyed);
    let err = controller.execute_async("x.py", "print(1)", None).await.unwrap_err();
    assert!(matches!(err, Error::Destroyed), "{err}");
    assert!(controller.execute_file("x.py", "print(1)").is_err());
    Ok(())
}
