use anyhow::Result;
use focusgate_core::{
    process::{create_directory, ProcessDirectory, ProcessSet},
    AgentConfig,
};
use std::collections::BTreeSet;
use tabled::{Table, Tabled};

#[derive(Debug, Tabled)]
struct ProcessRow {
    #[tabled(rename = "PID")]
    pid: u32,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Monitored")]
    monitored: String,
}

fn process_rows(
    processes: &ProcessSet,
    monitored: &BTreeSet<String>,
    all: bool,
) -> Vec<ProcessRow> {
    processes
        .iter()
        .map(|record| (record, monitored.contains(&record.name)))
        .filter(|(_, is_monitored)| all || *is_monitored)
        .map(|(record, is_monitored)| ProcessRow {
            pid: record.pid,
            name: record.name.clone(),
            monitored: if is_monitored { "yes" } else { "" }.to_string(),
        })
        .collect()
}

/// Print the session's processes, by default only the monitored ones.
pub async fn list_processes(config: &AgentConfig, all: bool) -> Result<()> {
    let policy = super::effective_policy(config).await;
    let directory = create_directory()?;
    let processes = directory.list_session_processes()?;

    let rows = process_rows(&processes, &policy.monitored_process_names, all);
    println!(
        "Session {}: {} processes, {} monitored",
        directory.session_id(),
        processes.len(),
        processes
            .iter()
            .filter(|record| policy.monitored_process_names.contains(&record.name))
            .count()
    );
    if rows.is_empty() {
        println!("No monitored processes are running.");
        return Ok(());
    }

    let table = Table::new(rows).to_string();
    println!("\n{table}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use focusgate_core::process::ProcessRecord;

    fn session() -> ProcessSet {
        [
            ProcessRecord::new(4, "explorer.exe"),
            ProcessRecord::new(10, "A.exe"),
            ProcessRecord::new(11, "A.exe"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_rows_default_to_monitored_only() {
        let monitored = ["A.exe".to_string()].into_iter().collect();
        let rows = process_rows(&session(), &monitored, false);
        assert_eq!(
            rows.iter().map(|row| row.pid).collect::<Vec<_>>(),
            vec![10, 11]
        );
        assert!(rows.iter().all(|row| row.monitored == "yes"));
    }

    #[test]
    fn test_rows_with_all_mark_monitored() {
        let monitored = ["A.exe".to_string()].into_iter().collect();
        let rows = process_rows(&session(), &monitored, true);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].name, "explorer.exe");
        assert_eq!(rows[0].monitored, "");
    }
}
