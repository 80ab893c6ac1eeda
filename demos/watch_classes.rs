// Watch classes being loaded into a JVM started with
//   -agentlib:jdwp=transport=dt_socket,server=y,suspend=n,address=5005
//
// The first five classes under com.example are printed with the stack of
// the loading thread, then the demo detaches.

use jdwp_engine::{
    DebugSession, EngineConfig, EventKind, JdwpError, RequestBuilder, SuspendPolicy,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("jdwp_engine=debug")
        .init();

    let session = DebugSession::attach("localhost", 5005, EngineConfig::default()).await?;
    println!("Connected, {} thread(s) running", session.coordinator().live_threads().len());

    session.requests().create(
        RequestBuilder::of_kind(EventKind::ClassPrepare)
            .suspend_policy(SuspendPolicy::EventThread)
            .class_filter("com.example.*")
            .count_filter(1)
            .enabled(),
    )?;
    let mut remaining = 5;
    let mut stream = session.subscribe();

    while remaining > 0 {
        let set = match stream.wait_for(EventKind::ClassPrepare, Duration::from_secs(30)).await {
            Ok(set) => set,
            Err(JdwpError::Timeout(_)) => {
                println!("No class loaded in 30s");
                break;
            }
            Err(e) => return Err(e.into()),
        };

        for event in set.events() {
            println!("Prepared {}", event.event.subject_class().unwrap_or("?"));
        }
        if let Some(thread) = set.thread() {
            for frame in session.frames(thread).await? {
                println!("  #{} {:?}", frame.depth(), frame.location()?);
            }
        }
        set.resume()?;
        remaining -= 1;

        // count filters expire; ask for the next one
        session.requests().create(
            RequestBuilder::of_kind(EventKind::ClassPrepare)
                .suspend_policy(SuspendPolicy::EventThread)
                .class_filter("com.example.*")
                .count_filter(1)
                .enabled(),
        )?;
    }

    session.detach().await?;
    println!("Detached");
    Ok(())
}
