//! Integration tests for container records across manager restarts.
use keel::runtime::{ContainerManager, ContainerRecord, ContainerStatus, RuntimeConfig};
use std::error::Error;
use tempfile::TempDir;

/// A PID no process can hold.
const DEAD_PID: u32 = 999_999_999;

fn config(temp: &TempDir) -> Result<RuntimeConfig, Box<dyn Error>> {
    let mountinfo = temp.path().join("mountinfo");
    std::fs::write(&mountinfo, "")?;
    Ok(RuntimeConfig::default()
        .with_root(temp.path().join("keel-root"))
        .with_mountinfo(mountinfo))
}

#[test_log::test(tokio::test)]
async fn stop_then_remove() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let config = config(&temp)?;

    let manager = ContainerManager::new(config.clone());
    let record = ContainerRecord::running("4816237591", "web", DEAD_PID, &["top".to_string()]);
    manager.state().save(&record)?;
    std::fs::write(config.paths.container_log("web"), "hello\n")?;

    // A fresh manager sees what the first one wrote.
    let manager = ContainerManager::new(config.clone());
    assert_eq!(manager.logs("web")?, "hello\n");

    let err = manager.remove("web").await.unwrap_err();
    assert!(err.to_string().contains("web"));

    let stopped = manager.stop("web")?;
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert!(stopped.pid.is_empty());

    manager.remove("web").await?;
    assert!(!manager.state().exists("web"));
    assert!(!config.paths.container("web").exists());
    assert!(manager.list()?.is_empty());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn list_marks_dead_containers_exited() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let config = config(&temp)?;
    let manager = ContainerManager::new(config.clone());

    let alive = ContainerRecord::running("1111111111", "alive", std::process::id(), &["sh".to_string()]);
    let dead = ContainerRecord::running("2222222222", "dead", DEAD_PID, &["sh".to_string()]);
    manager.state().save(&alive)?;
    manager.state().save(&dead)?;

    let records = manager.list()?;
    let status = |name: &str| {
        records
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.status)
    };
    assert_eq!(status("alive"), Some(ContainerStatus::Running));
    assert_eq!(status("dead"), Some(ContainerStatus::Exited));

    // The refresh is persisted.
    let reloaded = ContainerManager::new(config).state().load("dead")?;
    assert_eq!(reloaded.status, ContainerStatus::Exited);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn exec_requires_running_container() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let manager = ContainerManager::new(config(&temp)?);

    let mut record = ContainerRecord::running("3333333333", "web", DEAD_PID, &["sh".to_string()]);
    record.mark_stopped();
    manager.state().save(&record)?;

    assert!(manager.exec("web", &["ls".to_string()]).await.is_err());
    assert!(manager.exec("web", &[]).await.is_err());
    assert!(manager.exec("ghost", &["ls".to_string()]).await.is_err());

    Ok(())
}
