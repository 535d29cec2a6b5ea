use cs_api_types::StatusSnapshot;

use super::{api_client, friendly_error, Exit};

/// Run the `status` subcommand: call the API and pretty-print the snapshot.
pub async fn run(api_url: &str) -> anyhow::Result<Exit> {
    let resp = api_client()
        .get(format!("{}/status", api_url.trim_end_matches('/')))
        .send()
        .await
        .map_err(friendly_error)?;

    if !resp.status().is_success() {
        anyhow::bail!("Failed to fetch status (HTTP {})", resp.status());
    }
    let status: StatusSnapshot = resp.json().await.map_err(friendly_error)?;
    print!("{}", render(&status));
    Ok(Exit::Success)
}

fn render(status: &StatusSnapshot) -> String {
    let mut out = String::new();
    let line = |out: &mut String, s: String| {
        out.push_str(&s);
        out.push('\n');
    };
    line(&mut out, format!("code-squad status  (v{})", status.version));
    line(&mut out, "-".repeat(40));
    line(&mut out, format!("Uptime:          {}s", status.uptime_secs));
    line(
        &mut out,
        format!("LLM:             {}", if status.llm_available { "reachable" } else { "unreachable" }),
    );
    line(
        &mut out,
        format!(
            "Containers:      {} running, {} stopped{}",
            status.containers.running,
            status.containers.stopped,
            if status.containers.runtime_available { "" } else { " (runtime unavailable)" }
        ),
    );
    line(
        &mut out,
        format!(
            "Squad slots:     {}/{} in flight",
            status.squad.in_flight, status.squad.capacity
        ),
    );
    if let Some(a) = &status.autoscaler {
        line(
            &mut out,
            format!(
                "Autoscaler:      live {} (min {}, max {}), cpu {}, last {}",
                a.live,
                a.min,
                a.max,
                a.avg_cpu.map_or("-".to_string(), |c| format!("{c:.1}%")),
                a.last_action.as_deref().unwrap_or("none")
            ),
        );
    }
    if status.workers.is_empty() {
        line(&mut out, "Workers:         none started".into());
    } else {
        line(&mut out, "Workers:".into());
        for w in &status.workers {
            line(
                &mut out,
                format!(
                    "  {:<12} active {}  completed {}  failed {}",
                    w.language, w.active_tasks, w.completed, w.failed
                ),
            );
        }
    }
    out
}
