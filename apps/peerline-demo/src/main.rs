//! Runs two sessions over an in-memory link: alice sets an avatar and
//! sends bob a file, bob accepts it into his download directory.

mod events;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use peerline_avatar::placeholder_png;
use peerline_protocol::PeerId;
use peerline_session::{LoopbackConfig, LoopbackEnd, LoopbackTransport, Session, SessionConfig, logging};

const PEER: PeerId = PeerId(0);
const SAMPLE_SIZE: usize = 64 * 1024;

struct Node {
    session: Arc<Session>,
    transport: Arc<LoopbackTransport>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    fn start(
        name: &'static str,
        end: LoopbackEnd,
        base: &SessionConfig,
        root: &Path,
    ) -> anyhow::Result<Self> {
        let config = SessionConfig {
            portable: false,
            data_dir: Some(root.join(name)),
            download_dir: None,
            ..base.clone()
        };
        let session = Arc::new(
            Session::new(end.transport.clone(), &config)
                .with_context(|| format!("failed to create session for {name}"))?,
        );
        let transfers = session
            .take_transfer_events()
            .context("transfer events already taken")?;
        let avatars = session
            .take_avatar_events()
            .context("avatar events already taken")?;

        let cancel = CancellationToken::new();
        let runner = tokio::spawn({
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            let inbox = end.inbox;
            async move { session.run(inbox, cancel).await }
        });
        let watcher = tokio::spawn(events::event_loop(
            name,
            Arc::clone(&session),
            transfers,
            avatars,
            cancel.clone(),
        ));

        Ok(Self {
            session,
            transport: end.transport,
            cancel,
            tasks: vec![runner, watcher],
        })
    }

    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "node task panicked");
            }
        }
    }
}

fn sample_file(dir: &Path) -> anyhow::Result<(PathBuf, Vec<u8>)> {
    let data: Vec<u8> = (0..SAMPLE_SIZE).map(|i| (i % 251) as u8).collect();
    let path = dir.join("sample.bin");
    std::fs::write(&path, &data).with_context(|| format!("failed to write {}", path.display()))?;
    Ok((path, data))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(logging::DEFAULT_FILTER);

    let base = SessionConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        SessionConfig::default()
    });
    let root = std::env::temp_dir().join(format!("peerline-demo-{}", std::process::id()));

    let (a, b) = LoopbackTransport::pair(LoopbackConfig::default());
    let alice = Node::start("alice", a, &base, &root)?;
    let bob = Node::start("bob", b, &base, &root)?;

    let hash = alice.session.set_avatar(placeholder_png(48, 48)?)?;
    info!(%hash, "alice set an avatar while offline");

    alice.transport.set_online(true)?;
    bob.transport.set_online(true)?;

    let (path, data) = sample_file(&root.join("alice"))?;
    let id = alice.session.send_file(PEER, &path).await?;

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let done = alice
                .session
                .transfers()
                .snapshot_by_id(id)
                .is_some_and(|s| s.status.is_terminal());
            if done && bob.session.avatar_hash(PEER) == Some(hash) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if finished.is_err() {
        bail!("demo did not complete within 10 seconds");
    }

    let snap = alice
        .session
        .transfers()
        .snapshot_by_id(id)
        .context("transfer record vanished")?;
    info!(status = %snap.status, bytes = snap.transferred(), "outbound transfer ended");

    let received = bob.session.download_dir().join("sample.bin");
    let copied = std::fs::read(&received).with_context(|| format!("failed to read {}", received.display()))?;
    if copied != data {
        bail!("received file differs from the original");
    }
    info!(path = %received.display(), "file arrived intact");

    alice.stop().await;
    bob.stop().await;

    if let Err(e) = std::fs::remove_dir_all(&root) {
        warn!(path = %root.display(), error = %e, "failed to clean up demo directory");
    }
    Ok(())
}
