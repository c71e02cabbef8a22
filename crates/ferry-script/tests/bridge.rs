//! End-to-end tests running fy through a full bridge.

use std::sync::Arc;

use ferry_core::{
    Bridge, BridgeConfig, CaptureSink, ContextId, Error, FsLoader, LifecycleState, MemoryLoader,
    ModuleLoader, OutputStream,
};
use ferry_script::{SCRIPT_EXTENSION, ScriptEngineFactory, ScriptLibrary, StripTypeAnnotations};
use serde_json::{Value, json};

async fn start(
    loader: impl ModuleLoader,
    library: ScriptLibrary,
    sink: Arc<CaptureSink>,
) -> Bridge {
    Bridge::builder(ScriptEngineFactory::new(library))
        .loader(loader)
        .sink(sink)
        .preprocess(StripTypeAnnotations)
        .start()
        .await
        .unwrap()
}

fn modules() -> MemoryLoader {
    MemoryLoader::new()
        .with_module("math", "export let x = 5\nexport let square = x * x")
        .with_module("noisy", "print(\"noisy loaded\")\nexport let ready = true")
        .with_module("uses_math", "import { x } from \"math\"\nexport let twice = x * 2")
        .with_module("broken", "export let = 1")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_eval_completes_once() {
    let bridge = start(modules(), ScriptLibrary::new(), Arc::new(CaptureSink::new())).await;
    let main = bridge.main();
    main.eval("let i = 0").await.unwrap();

    let results =
        futures::future::join_all((0..100).map(|_| main.eval("i += 1; i"))).await;
    let mut seen: Vec<i64> = results
        .into_iter()
        .map(|result| result.unwrap().as_i64().unwrap())
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (1..=100).collect::<Vec<_>>());
    assert_eq!(main.eval("i").await.unwrap(), 100);
    assert_eq!(main.in_flight(), 0);

    bridge.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_side_effect_module_runs_once_per_context() {
    let sink = Arc::new(CaptureSink::new());
    let bridge = start(modules(), ScriptLibrary::new(), sink.clone()).await;
    let main = bridge.main();

    main.import("noisy").await.unwrap();
    main.import("noisy").await.unwrap();
    main.eval_module("import { ready } from \"noisy\"\nprint(ready)")
        .await
        .unwrap();
    // Already evaluated, so a script may reach it synchronously.
    assert_eq!(main.eval("import(\"noisy\").ready").await.unwrap(), true);

    bridge.shutdown().await.unwrap();
    assert_eq!(
        sink.text(ContextId::Main, OutputStream::Stdout),
        "noisy loaded\ntrue\n"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_eval_module_resolves_imports() {
    let sink = Arc::new(CaptureSink::new());
    let bridge = start(modules(), ScriptLibrary::new(), sink.clone()).await;
    let main = bridge.main();

    main.eval_module("let m = import(\"math\"); print(m.x)")
        .await
        .unwrap();
    main.eval_module("import { twice } from \"uses_math\"\nprint(twice)")
        .await
        .unwrap();

    bridge.shutdown().await.unwrap();
    assert_eq!(sink.text(ContextId::Main, OutputStream::Stdout), "5\n10\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failures_keep_the_context_usable() {
    let bridge = start(modules(), ScriptLibrary::new(), Arc::new(CaptureSink::new())).await;
    let main = bridge.main();

    assert!(matches!(main.eval("let = 1").await, Err(Error::Evaluation(_))));
    assert!(matches!(
        main.eval("throw \"boom\"").await,
        Err(Error::Evaluation(ref m)) if m.contains("boom")
    ));
    assert!(matches!(main.import("nowhere").await, Err(Error::Resolution { .. })));
    assert!(matches!(main.import("broken").await, Err(Error::Resolution { .. })));
    assert!(matches!(
        main.eval_module("import { nope } from \"math\"").await,
        Err(Error::Link { .. })
    ));
    assert!(matches!(main.load("missing").await, Err(Error::NotFound(_))));

    assert_eq!(main.state(), LifecycleState::Active);
    assert_eq!(main.eval("1 + 1").await.unwrap(), 2);

    bridge.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_and_type_annotations() {
    let library = ScriptLibrary::new().with_script("setup", "let greeting: Str = \"hi\"");
    let bridge = start(modules(), library, Arc::new(CaptureSink::new())).await;
    let main = bridge.main();

    main.load("setup").await.unwrap();
    assert_eq!(main.eval("greeting + \"!\"").await.unwrap(), "hi!");
    assert_eq!(main.eval("let n: Int = 41; n + 1").await.unwrap(), 42);

    bridge.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workers() {
    let sink = Arc::new(CaptureSink::new());
    let bridge = start(modules(), ScriptLibrary::new(), sink.clone()).await;

    let id = bridge
        .spawn_worker(vec!["job".to_string()], json!({"size": 3}))
        .await
        .unwrap();
    let worker = bridge.worker(id).unwrap();
    assert_eq!(worker.eval("1+1").await.unwrap(), 2);
    assert_eq!(worker.eval("argv[0] + \":\" + str(init.size)").await.unwrap(), "job:3");
    assert_eq!(worker.eval("context").await.unwrap(), Value::String(id.context_id().to_string()));

    // Globals are per context.
    worker.eval("let only_here = 1").await.unwrap();
    assert!(bridge.main().eval("only_here").await.is_err());

    worker.eval("print(\"from worker\")").await.unwrap();
    bridge.stop_worker(id).await.unwrap();
    bridge.stop_worker(id).await.unwrap();
    assert_eq!(worker.state(), LifecycleState::Terminated);
    assert!(matches!(
        worker.eval("1").await,
        Err(Error::InactiveContext { .. })
    ));
    assert_eq!(
        sink.text(id.context_id(), OutputStream::Stdout),
        "from worker\n"
    );

    bridge.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_all_drains_workers() {
    let sink = Arc::new(CaptureSink::new());
    let bridge = start(modules(), ScriptLibrary::new(), sink.clone()).await;

    let mut handles = Vec::new();
    for _ in 0..3 {
        let id = bridge.spawn_worker(Vec::new(), Value::Null).await.unwrap();
        handles.push(bridge.worker(id).unwrap());
    }
    let pending: Vec<_> = handles
        .iter()
        .map(|worker| {
            let worker = worker.clone();
            tokio::spawn(async move { worker.eval("print(context)").await })
        })
        .collect();

    bridge.stop_all().await.unwrap();
    assert!(bridge.worker_ids().is_empty());
    for worker in &handles {
        assert_eq!(worker.state(), LifecycleState::Terminated);
        assert_eq!(worker.in_flight(), 0);
    }

    let written = sink.total_bytes();
    for task in pending {
        // Either ran before the stop or was rejected; never left hanging.
        let _ = task.await.unwrap();
    }
    assert_eq!(sink.total_bytes(), written);

    bridge.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_modules_from_disk() {
    let temp = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("lib")).unwrap();
    std::fs::write(temp.path().join("lib/shapes.fy"), "export let sides = 4").unwrap();

    let loader = FsLoader::new(temp.path()).with_extension(SCRIPT_EXTENSION);
    let bridge = Bridge::builder(ScriptEngineFactory::default())
        .loader(loader)
        .sink(Arc::new(CaptureSink::new()))
        .config(BridgeConfig {
            main_argv: vec!["disk".to_string()],
            ..BridgeConfig::default()
        })
        .start()
        .await
        .unwrap();
    let main = bridge.main();

    main.import("lib/shapes").await.unwrap();
    assert_eq!(main.eval("import(\"lib/shapes\").sides").await.unwrap(), 4);
    assert_eq!(main.eval("argv").await.unwrap(), json!(["disk"]));
    assert!(matches!(main.import("../outside").await, Err(Error::Resolution { .. })));

    bridge.shutdown().await.unwrap();
}
