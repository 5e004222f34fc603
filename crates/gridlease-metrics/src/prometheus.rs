//! Prometheus text exposition format.

use crate::collector::DeploymentCount;

/// Render deployment counts as a `gridlease_deployments_total` counter with
/// `user`, `tier`, and `role` labels.
pub fn render_prometheus(counts: &[DeploymentCount]) -> String {
    let mut out = String::new();

    out.push_str("# HELP gridlease_deployments_total Deployed VMs and cluster nodes.\n");
    out.push_str("# TYPE gridlease_deployments_total counter\n");
    for c in counts {
        out.push_str(&format!(
            "gridlease_deployments_total{{user=\"{}\",tier=\"{}\",role=\"{}\"}} {}\n",
            escape(&c.user_id),
            c.tier,
            c.role,
            c.count
        ));
    }

    out
}

/// Escape a label value per the exposition format.
fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
