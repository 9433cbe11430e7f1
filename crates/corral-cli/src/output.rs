use serde_json::Value;

/// Render /status as human-readable text.
pub fn render_status(body: &Value) -> String {
    let mut out = String::new();
    let pipeline = &body["pipeline"];
    out.push_str(&format!(
        "pipeline: {}  backlog={}  global_sequence={}\n",
        if pipeline["ready"] == Value::Bool(true) { "ready" } else { "down" },
        pipeline["backlog"],
        pipeline["global_sequence"],
    ));

    match body["isolates"].as_array() {
        Some(isolates) if !isolates.is_empty() => {
            out.push_str("isolates:\n");
            for isolate in isolates {
                out.push_str(&format!(
                    "  {}  restarts={}  started_at={}\n",
                    isolate["plugin_id"].as_str().unwrap_or("?"),
                    isolate["restart_count"],
                    isolate["started_at"].as_str().unwrap_or("?"),
                ));
            }
        }
        _ => out.push_str("isolates: none\n"),
    }
    out
}

/// Render the verification report.
pub fn render_verify(body: &Value) -> String {
    let data = &body["data"];
    if data["valid"] == Value::Bool(true) {
        format!("chain OK ({} logs verified)\n", data["checked"])
    } else {
        format!(
            "chain BROKEN after {} logs: {}\n",
            data["checked"],
            data["error"].as_str().unwrap_or("unknown"),
        )
    }
}

/// Render a join outcome.
pub fn render_join(body: &Value) -> String {
    let data = &body["data"];
    format!(
        "{}  node_id={}  core_ip={}\n",
        data["status"].as_str().unwrap_or("?"),
        data["node_id"].as_str().unwrap_or("?"),
        data["core_ip"].as_str().unwrap_or("?"),
    )
}
