// watch.rs — Policy bundle hot-reload.
//
// Watches the directory holding the policy file (editors often replace the
// file rather than write it in place) and reloads the bundle when the file
// is created or modified. Bursts of events are collapsed. A bundle that
// fails to load is logged and the current one stays.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use wd_gateway::{Gateway, PolicyBundle};

/// Audit subject for reloads triggered by the watcher.
pub const WATCHER: &str = "policy-watcher";

const DEBOUNCE: Duration = Duration::from_millis(250);

/// Start watching `path`. The watcher stops when the returned handle is
/// dropped.
pub fn watch_policy(gateway: Arc<Gateway>, path: PathBuf) -> notify::Result<RecommendedWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let target = path.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if touches(&event, &target) => {
            let _ = tx.send(());
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("policy watcher error: {}", e),
    })?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    tracing::info!(path = %path.display(), "watching policy bundle");

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            tokio::time::sleep(DEBOUNCE).await;
            while rx.try_recv().is_ok() {}
            reload(&gateway, &path);
        }
    });
    Ok(watcher)
}

/// Whether `event` is a write to the policy file.
pub fn touches(event: &Event, policy: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some() && p.file_name() == policy.file_name())
}

/// Load the file and swap it in unless it is byte-identical to the
/// current bundle.
pub fn reload(gateway: &Gateway, path: &Path) {
    let bundle = match PolicyBundle::load(path) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(path = %path.display(), "policy file not reloaded: {}", e);
            return;
        }
    };
    match gateway.current_bundle() {
        Ok(current) if current.digest() == bundle.digest() => {
            tracing::debug!("policy file unchanged");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!("cannot read current bundle: {}", e);
            return;
        }
    }
    if let Err(e) = gateway.reload_bundle(bundle, WATCHER) {
        tracing::error!("policy reload failed, keeping current bundle: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};

    #[test]
    fn only_writes_to_the_policy_file_count() {
        let policy = Path::new("/etc/warden/policy.yaml");
        let write = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/warden/policy.yaml"));
        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/etc/warden/policy.yaml"));
        let other = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/warden/warden.toml"));
        let read = Event::new(EventKind::Access(AccessKind::Any))
            .add_path(PathBuf::from("/etc/warden/policy.yaml"));

        assert!(touches(&write, policy));
        assert!(touches(&create, policy));
        assert!(!touches(&other, policy));
        assert!(!touches(&read, policy));
    }

    #[test]
    fn reload_swaps_changed_bundle_and_skips_identical_or_broken_ones() {
        let dir = tempfile::tempdir().unwrap();
        let config = wd_gateway::GatewayConfig::for_dir(dir.path());
        std::fs::write(&config.paths.policy, "version: one\n").unwrap();
        let gateway = Gateway::open(&config).unwrap();

        reload(&gateway, &config.paths.policy);
        assert_eq!(gateway.audit().events_with_action("policy_reload").unwrap().len(), 0);

        std::fs::write(&config.paths.policy, "version: two\n").unwrap();
        reload(&gateway, &config.paths.policy);
        assert_eq!(gateway.current_bundle().unwrap().version(), "two");
        let reloads = gateway.audit().events_with_action("policy_reload").unwrap();
        assert_eq!(reloads.len(), 1);
        assert_eq!(reloads[0].subject, WATCHER);

        std::fs::write(&config.paths.policy, "rules: [[[").unwrap();
        reload(&gateway, &config.paths.policy);
        assert_eq!(gateway.current_bundle().unwrap().version(), "two");
    }
}
