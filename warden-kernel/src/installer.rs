//! Script d'installation de l'agent et commandes shell associées.
//!
//! Le script est servi par `GET /agent/install.sh?token=…` ; l'installation
//! initiale et la remédiation le récupèrent avec le token stocké de l'hôte.

use serde::Serialize;
use shell_words::quote;

pub const UNIT_NAME: &str = "warden-agent";
pub const SCRIPT_PATH: &str = "/tmp/warden-agent-install.sh";

/// Arrêt, désactivation et suppression de l'unité systemd de l'agent.
/// Chaque étape tolère l'échec de la précédente.
pub const UNINSTALL_COMMAND: &str = "systemctl stop warden-agent 2>/dev/null; \
systemctl disable warden-agent 2>/dev/null; \
rm -f /etc/systemd/system/warden-agent.service; \
systemctl daemon-reload 2>/dev/null; \
rm -f /usr/local/bin/warden-agent; \
rm -rf /etc/warden-agent; \
true";

pub fn script_url(panel_address: &str, token: &str) -> String {
    format!("{}/agent/install.sh?token={}", panel_address.trim_end_matches('/'), token)
}

/// Installation directe : le script est téléchargé puis exécuté
pub fn install_command(panel_address: &str, token: &str) -> String {
    format!("curl -fsSL {} | bash", quote(&script_url(panel_address, token)))
}

/// Téléchargement seul, vers `SCRIPT_PATH`
pub fn fetch_script_command(panel_address: &str, token: &str) -> String {
    format!("curl -fsSL {} -o {}", quote(&script_url(panel_address, token)), SCRIPT_PATH)
}

pub fn run_script_command() -> String {
    format!("bash {SCRIPT_PATH}")
}

/// Contenu de `/etc/warden-agent/config.toml`, lu par l'agent au démarrage
#[derive(Serialize)]
struct InstalledConfig<'a> {
    host: &'a str,
    token: &'a str,
    kernel_url: &'a str,
}

/// Rend le script bash d'installation pour un hôte.
/// La config passe par le sérialiseur TOML puis `quote`, comme le message :
/// aucune valeur n'est interpolée brute dans le script.
pub fn render_install_script(
    host: &str,
    token: &str,
    channel_url: &str,
    binary_url: &str,
) -> Result<String, toml::ser::Error> {
    let config = toml::to_string(&InstalledConfig { host, token, kernel_url: channel_url })?;
    let config = quote(&config).into_owned();
    let banner = quote(&format!("[warden] installing agent for {host}")).into_owned();
    Ok(format!(
        r#"#!/usr/bin/env bash
set -euo pipefail

echo {banner}

install -d -m 0755 /etc/warden-agent
printf '%s' {config} > /etc/warden-agent/config.toml
chmod 0600 /etc/warden-agent/config.toml

curl -fsSL {binary} -o /usr/local/bin/{unit}.new
chmod 0755 /usr/local/bin/{unit}.new
mv /usr/local/bin/{unit}.new /usr/local/bin/{unit}

cat > /etc/systemd/system/{unit}.service <<'WARDEN_EOF'
[Unit]
Description=Warden host agent
After=network-online.target
Wants=network-online.target

[Service]
Environment=WARDEN_AGENT_CONFIG=/etc/warden-agent/config.toml
ExecStart=/usr/local/bin/{unit}
Restart=always
RestartSec=5

[Install]
WantedBy=multi-user.target
WARDEN_EOF

systemctl daemon-reload
systemctl enable {unit}
systemctl restart {unit}

echo "[warden] agent installed"
"#,
        banner = banner,
        config = config,
        binary = quote(binary_url),
        unit = UNIT_NAME,
    ))
}
