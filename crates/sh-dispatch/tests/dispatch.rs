use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use futures::executor::block_on;
use futures::future::join_all;
use sh_core::{DispatcherOptions, ErrorKind, LockingMode, Value};
use sh_dispatch::{Dispatcher, TaskStatus};
use sh_runtime::{ContextOptions, EngineContext, EngineHolder, ScriptEngine};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn dispatcher() -> Dispatcher {
    init_tracing();
    let context = EngineContext::with_holder(
        Arc::new(EngineHolder::new(ScriptEngine::new(), LockingMode::Enabled)),
        ContextOptions::default(),
    );
    Dispatcher::spawn(Arc::new(context), DispatcherOptions::default()).expect("spawn dispatcher")
}

/// Parks the worker until the returned sender fires. Returns once the
/// blocking task has started.
fn block_worker(dispatcher: &Dispatcher) -> (mpsc::Sender<()>, sh_dispatch::TaskHandle<()>) {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let handle = dispatcher.submit(move |_| {
        started_tx.send(()).expect("signal start");
        release_rx.recv().expect("wait for release");
        Ok(())
    });
    started_rx.recv().expect("blocking task started");
    (release_tx, handle)
}

#[test]
fn eval_resolves_through_the_future() {
    let dispatcher = dispatcher();
    let value = dispatcher.submit_eval("2 + 3").wait().expect("eval");
    assert_eq!(value, Value::Number(5.0));

    let value = block_on(dispatcher.submit_eval("\"x\" + 1")).expect("await");
    assert_eq!(value, Value::from("x1"));
}

#[test]
fn method_invocation_on_script_object() {
    let dispatcher = dispatcher();
    let gobj = dispatcher
        .submit(|context| {
            context.load_persistent(
                "globalCode",
                "let gobj = #{ a: 3, adder: |b| this.a + b };",
            )?;
            context.script_object("gobj")
        })
        .wait()
        .expect("script object");
    assert!(gobj.as_handle().is_some());

    let value = dispatcher
        .submit_method_invocation(gobj, "adder", vec![Value::Number(2.0)])
        .wait()
        .expect("method");
    assert_eq!(value, Value::Number(5.0));
}

#[test]
fn wrappers_cover_persistent_functions_and_modules() {
    let dispatcher = dispatcher();
    dispatcher
        .submit_load_persistent("m", "fn f(a, b) { a + b }")
        .wait()
        .expect("load");
    dispatcher
        .submit_load_modules(vec![(
            "lib/consts.rhai".to_string(),
            "export const TEN = 10;".to_string(),
        )])
        .wait()
        .expect("modules");

    let sum = dispatcher
        .submit_function_invocation("f", vec![Value::Number(3.0), Value::Number(2.0)])
        .wait()
        .expect("invoke");
    assert_eq!(sum, Value::Number(5.0));

    let ten = dispatcher
        .submit_eval(r#"import "lib/consts" as c; c::TEN"#)
        .wait()
        .expect("import");
    assert_eq!(ten, Value::Number(10.0));
}

#[test]
fn by_reference_arguments_are_visible_inside_submit() {
    let dispatcher = dispatcher();
    dispatcher
        .submit_load_persistent("m", r#"fn mutate(arr) { arr[1] = "x"; }"#)
        .wait()
        .expect("load");
    let args = dispatcher
        .submit(|context| {
            let mut args = vec![Value::Array(vec![
                Value::Number(1.0),
                Value::Number(2.0),
                Value::Number(3.0),
            ])];
            context.invoke_function("mutate", &mut args)?;
            Ok(args)
        })
        .wait()
        .expect("invoke");
    assert_eq!(
        args[0],
        Value::Array(vec![Value::Number(1.0), Value::from("x"), Value::Number(3.0)])
    );
}

#[test]
fn tasks_from_many_threads_run_in_submission_order() {
    let dispatcher = Arc::new(dispatcher());
    let submitted = Arc::new(Mutex::new(Vec::new()));
    let executed = Arc::new(Mutex::new(Vec::new()));
    let handles = Arc::new(Mutex::new(Vec::new()));

    let producers = (0..4)
        .map(|producer| {
            let dispatcher = Arc::clone(&dispatcher);
            let submitted = Arc::clone(&submitted);
            let executed = Arc::clone(&executed);
            let handles = Arc::clone(&handles);
            thread::spawn(move || {
                for index in 0..25 {
                    let label = producer * 100 + index;
                    let executed = Arc::clone(&executed);
                    // Holding the log lock while submitting pins the queue order.
                    let mut order = submitted.lock().expect("submitted lock");
                    order.push(label);
                    let handle = dispatcher.submit(move |context| {
                        executed.lock().expect("executed lock").push(label);
                        context.eval("1 + 1")
                    });
                    drop(order);
                    handles.lock().expect("handles lock").push(handle);
                }
            })
        })
        .collect::<Vec<_>>();
    for producer in producers {
        producer.join().expect("producer");
    }

    let handles = std::mem::take(&mut *handles.lock().expect("handles lock"));
    let results = block_on(join_all(handles));
    assert_eq!(results.len(), 100);
    assert!(results.iter().all(|result| result.is_ok()));
    assert_eq!(
        *executed.lock().expect("executed lock"),
        *submitted.lock().expect("submitted lock")
    );
}

#[test]
fn cancelled_task_never_runs() {
    let dispatcher = dispatcher();
    let (release, blocker) = block_worker(&dispatcher);

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let victim = dispatcher.submit(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    let survivor = dispatcher.submit_eval("40 + 2");
    assert_eq!(dispatcher.pending(), 2);

    assert!(victim.cancel());
    assert_eq!(victim.status(), TaskStatus::Cancelled);
    assert_eq!(dispatcher.pending(), 1);
    assert!(!blocker.cancel());
    assert_eq!(blocker.status(), TaskStatus::Running);

    release.send(()).expect("release worker");
    blocker.wait().expect("blocker finishes");
    let error = victim.wait().expect_err("cancelled");
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert_eq!(error.code, "DISPATCH_TASK_CANCELLED");
    assert_eq!(survivor.wait().expect("survivor"), Value::Number(42.0));
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn cancelling_a_finished_task_changes_nothing() {
    let dispatcher = dispatcher();
    let handle = dispatcher.submit_eval("7");
    let later = dispatcher.submit_eval("8");
    assert_eq!(later.wait().expect("later"), Value::Number(8.0));
    assert_eq!(handle.status(), TaskStatus::Completed);
    assert!(!handle.cancel());
    assert_eq!(handle.wait().expect("value"), Value::Number(7.0));
}

#[test]
fn panicking_task_fails_and_worker_survives() {
    let dispatcher = dispatcher();
    let error = dispatcher
        .submit(|_| -> Result<(), sh_core::HostError> { panic!("task blew up") })
        .wait()
        .expect_err("panic");
    assert_eq!(error.code, "DISPATCH_TASK_PANICKED");
    assert_eq!(error.kind, ErrorKind::Engine);
    assert!(error.message.contains("task blew up"));

    assert_eq!(
        dispatcher.submit_eval("1 + 1").wait().expect("still serving"),
        Value::Number(2.0)
    );
}

#[test]
fn engine_errors_propagate_unchanged() {
    let dispatcher = dispatcher();
    let handle = dispatcher.submit_eval(r#"throw "bad""#);
    let id = handle.id();
    let error = handle.wait().expect_err("engine error");
    assert_eq!(error.kind, ErrorKind::Engine);
    assert_eq!(error.code, "ENGINE_EVAL_ERROR");
    assert!(id > 0);

    let error = dispatcher
        .submit_function_invocation("missing", Vec::new())
        .wait()
        .expect_err("missing function");
    assert_eq!(error.code, "ENGINE_FUNCTION_NOT_FOUND");
}

#[test]
fn raw_access_while_worker_runs_is_rejected() {
    let dispatcher = dispatcher();
    let context = Arc::clone(dispatcher.context());
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holding = dispatcher.submit(move |context| {
        context.with_engine_and_scope(|_, _| {
            started_tx.send(()).expect("signal start");
            release_rx.recv().expect("wait for release");
            Ok(())
        })
    });
    started_rx.recv().expect("worker holds engine");

    let error = context.eval("1").expect_err("raw access");
    assert_eq!(error.kind, ErrorKind::Concurrency);
    assert_eq!(error.code, "ENGINE_CONCURRENT_ACCESS");

    release_tx.send(()).expect("release");
    holding.wait().expect("holding task");
    assert_eq!(context.eval("1").expect("raw after"), Value::Number(1.0));
}

#[test]
fn shutdown_drains_queued_tasks() {
    let dispatcher = dispatcher();
    let (release, blocker) = block_worker(&dispatcher);
    let queued = (0..5)
        .map(|index| dispatcher.submit_eval(format!("{} * 2", index)))
        .collect::<Vec<_>>();

    release.send(()).expect("release");
    dispatcher.shutdown().expect("shutdown");

    blocker.wait().expect("blocker");
    for (index, handle) in queued.into_iter().enumerate() {
        assert_eq!(handle.status(), TaskStatus::Completed);
        assert_eq!(
            handle.wait().expect("drained"),
            Value::Number((index * 2) as f64)
        );
    }
}

#[test]
fn dropped_handle_does_not_stop_the_task() {
    let dispatcher = dispatcher();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    drop(dispatcher.submit(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    }));
    dispatcher.submit_eval("0").wait().expect("barrier");
    assert!(ran.load(Ordering::SeqCst));
}
