// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rendering of systemd units and polkit rules

use super::{PolkitRule, SplunkUnit};

/// Unit that turns transparent huge pages off at boot
pub const THP_UNIT: &str = "disable-thp";

pub fn splunkd_unit(unit: &SplunkUnit) -> String {
    let mut out = String::new();
    out.push_str("# Managed by splunk-fleet\n");
    out.push_str("[Unit]\n");
    out.push_str(&format!("Description={}\n", unit.description));
    out.push_str("After=network-online.target\n");
    out.push_str("Wants=network-online.target\n");
    out.push('\n');
    out.push_str("[Service]\n");
    out.push_str("Type=simple\n");
    out.push_str("Restart=always\n");
    out.push_str(&format!(
        "ExecStart={}/bin/splunk _internal_launch_under_systemd\n",
        unit.splunk_home
    ));
    out.push_str("KillMode=mixed\n");
    out.push_str("KillSignal=SIGINT\n");
    out.push_str(&format!("TimeoutStopSec={}\n", unit.timeout_stop_secs));
    out.push_str(&format!("LimitNOFILE={}\n", unit.limit_nofile));
    out.push_str(&format!("LimitNPROC={}\n", unit.limit_nproc));
    out.push_str("LimitRTPRIO=99\n");
    out.push_str("SuccessExitStatus=51 52\n");
    out.push_str("RestartPreventExitStatus=51\n");
    out.push_str("RestartForceExitStatus=52\n");
    out.push_str(&format!("User={}\n", unit.user));
    out.push_str(&format!("Group={}\n", unit.group));
    out.push_str("Delegate=true\n");
    if let Some(memory) = &unit.memory_max {
        out.push_str(&format!("MemoryMax={}\n", memory));
    }
    out.push_str(&format!(
        "Environment=SPLUNK_HOME={}\n",
        unit.splunk_home
    ));
    out.push('\n');
    out.push_str("[Install]\n");
    out.push_str("WantedBy=multi-user.target\n");
    out
}

/// Boot-time unit turning THP off before the given services start
pub fn thp_unit(services: &[String]) -> String {
    let mut out = String::new();
    out.push_str("# Managed by splunk-fleet\n");
    out.push_str("[Unit]\n");
    out.push_str("Description=Disable Transparent Huge Pages\n");
    out.push_str("DefaultDependencies=no\n");
    out.push_str("After=sysinit.target local-fs.target\n");
    if !services.is_empty() {
        let before: Vec<String> = services.iter().map(|s| format!("{}.service", s)).collect();
        out.push_str(&format!("Before={}\n", before.join(" ")));
    }
    out.push('\n');
    out.push_str("[Service]\n");
    out.push_str("Type=oneshot\n");
    out.push_str("ExecStart=/bin/sh -c 'echo never > /sys/kernel/mm/transparent_hugepage/enabled && echo never > /sys/kernel/mm/transparent_hugepage/defrag'\n");
    out.push('\n');
    out.push_str("[Install]\n");
    out.push_str("WantedBy=basic.target\n");
    out
}

fn js_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|i| format!("\"{}\"", i)).collect();
    format!("[{}]", quoted.join(", "))
}

pub fn polkit_rule(rule: &PolkitRule) -> String {
    let units: Vec<String> = rule
        .units
        .iter()
        .map(|u| {
            if u.ends_with(".service") {
                u.clone()
            } else {
                format!("{}.service", u)
            }
        })
        .collect();

    format!(
        "// Managed by splunk-fleet\n\
         polkit.addRule(function(action, subject) {{\n    \
             if (action.id == \"org.freedesktop.systemd1.manage-units\" &&\n        \
                 {}.indexOf(action.lookup(\"unit\")) >= 0 &&\n        \
                 {}.indexOf(action.lookup(\"verb\")) >= 0 &&\n        \
                 subject.user == \"{}\") {{\n        \
                 return polkit.Result.YES;\n    \
             }}\n\
         }});\n",
        js_list(&units),
        js_list(&rule.verbs),
        rule.user
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splunkd_unit_contents() {
        let unit = SplunkUnit {
            name: "Splunkd".to_string(),
            description: "Splunk Enterprise".to_string(),
            splunk_home: "/opt/splunk".to_string(),
            user: "splunk".to_string(),
            group: "splunk".to_string(),
            limit_nofile: 65536,
            limit_nproc: 16000,
            timeout_stop_secs: 360,
            memory_max: Some("8G".to_string()),
        };
        let rendered = splunkd_unit(&unit);
        assert!(rendered.contains("ExecStart=/opt/splunk/bin/splunk _internal_launch_under_systemd"));
        assert!(rendered.contains("LimitNOFILE=65536"));
        assert!(rendered.contains("User=splunk"));
        assert!(rendered.contains("MemoryMax=8G"));
    }

    #[test]
    fn test_thp_unit_orders_before_services() {
        let rendered = thp_unit(&["splunkforwarder".to_string()]);
        assert!(rendered.contains("Before=splunkforwarder.service\n"));
        assert!(!rendered.contains("Splunkd"));

        let both = thp_unit(&["Splunkd".to_string(), "splunk-idx2".to_string()]);
        assert!(both.contains("Before=Splunkd.service splunk-idx2.service\n"));
        assert!(!thp_unit(&[]).contains("Before="));
    }

    #[test]
    fn test_polkit_rule_contents() {
        let rule = PolkitRule {
            name: "splunk".to_string(),
            priority: 10,
            user: "splunk".to_string(),
            units: vec!["Splunkd".to_string()],
            verbs: vec!["start".to_string(), "stop".to_string()],
        };
        let rendered = polkit_rule(&rule);
        assert!(rendered.contains("[\"Splunkd.service\"].indexOf(action.lookup(\"unit\"))"));
        assert!(rendered.contains("[\"start\", \"stop\"]"));
        assert!(rendered.contains("subject.user == \"splunk\""));
        assert!(rendered.trim_end().ends_with("});"));
    }
}
