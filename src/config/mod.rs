use std::{
    collections::HashMap,
    env,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use directories::BaseDirs;

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        let config_path = env::var("NAGINI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_config_path());
        Self::load_from(&config_path)
    }

    /// Defaults, then the rc file at `config_path`, then the environment.
    pub fn load_from(config_path: &Path) -> Self {
        let mut map = default_map();

        if let Ok(file) = fs::File::open(config_path) {
            let reader = BufReader::new(file);
            for line in reader.lines().map_while(Result::ok) {
                if let Some((k, v)) = parse_line(&line) {
                    map.insert(k, v);
                }
            }
        }

        // Environment takes precedence; NAGINI_FOO is accepted for FOO.
        for (k, v) in env::vars() {
            if let Some(key) = config_key(&k) {
                map.insert(key, v);
            }
        }

        Self { inner: map, config_path: config_path.to_path_buf() }
    }

    /// Defaults only, ignoring rc files and the environment.
    pub fn defaults() -> Self {
        Self { inner: default_map(), config_path: default_config_path() }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).cloned()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn get_millis(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }

    /// Comma separated list; blank items dropped.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn python_bin(&self) -> String {
        self.get("PYTHON_BIN").unwrap_or_else(|| "python3".into())
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (k, v) = line.split_once('=')?;
    Some((k.trim().to_string(), v.trim().to_string()))
}

const KEYS: &[&str] = &[
    "PYTHON_BIN",
    "EXECUTION_TIMEOUT_MS",
    "FS_TIMEOUT_MS",
    "READY_TIMEOUT_MS",
    "DEFAULT_PACKAGES",
    "FILE_LOAD_RETRIES",
    "FILE_LOAD_RETRY_DELAY_MS",
    "REQUEST_TIMEOUT",
    "PRETTIFY_OUTPUT",
];

fn config_key(k: &str) -> Option<String> {
    if KEYS.contains(&k) {
        return Some(k.to_string());
    }
    match k.strip_prefix("NAGINI_") {
        Some("CONFIG") | None => None,
        Some(rest) if !rest.is_empty() => Some(rest.to_string()),
        Some(_) => None,
    }
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("nagini").join(".naginirc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();

    m.insert("PYTHON_BIN".into(), "python3".into());
    m.insert("DEFAULT_PACKAGES".into(), String::new());

    // Numbers
    m.insert("EXECUTION_TIMEOUT_MS".into(), "30000".into());
    m.insert("FS_TIMEOUT_MS".into(), "10000".into());
    m.insert("READY_TIMEOUT_MS".into(), "120000".into());
    m.insert("FILE_LOAD_RETRIES".into(), "3".into());
    m.insert("FILE_LOAD_RETRY_DELAY_MS".into(), "1000".into());
    m.insert("REQUEST_TIMEOUT".into(), "60".into());

    // Bools as strings
    m.insert("PRETTIFY_OUTPUT".into(), "true".into());

    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_timeouts() {
        let cfg = Config::defaults();
        assert_eq!(cfg.get_millis("EXECUTION_TIMEOUT_MS"), Some(Duration::from_secs(30)));
        assert_eq!(cfg.get_millis("FS_TIMEOUT_MS"), Some(Duration::from_secs(10)));
        assert_eq!(cfg.python_bin(), "python3");
        assert!(cfg.get_bool("PRETTIFY_OUTPUT"));
        assert!(cfg.get_list("DEFAULT_PACKAGES").is_empty());
    }

    #[test]
    fn rc_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join(".naginirc");
        fs::write(
            &rc,
            "# comment\nFS_TIMEOUT_MS = 2500\nDEFAULT_PACKAGES=numpy, pandas ,,\nbroken line\n",
        )
        .unwrap();
        let cfg = Config::load_from(&rc);
        assert_eq!(cfg.get_u64("FS_TIMEOUT_MS"), Some(2500));
        assert_eq!(cfg.get_list("DEFAULT_PACKAGES"), vec!["numpy", "pandas"]);
        assert_eq!(cfg.config_path, rc);
    }

    #[test]
    fn prefixed_environment_keys_map_to_plain_keys() {
        assert_eq!(config_key("NAGINI_PYTHON_BIN").as_deref(), Some("PYTHON_BIN"));
        assert_eq!(config_key("FS_TIMEOUT_MS").as_deref(), Some("FS_TIMEOUT_MS"));
        assert_eq!(config_key("NAGINI_CONFIG"), None);
        assert_eq!(config_key("HOME"), None);
    }

    #[test]
    fn parse_line_skips_comments_and_blanks() {
        assert_eq!(parse_line("  # x=1"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("A = b=c"), Some(("A".into(), "b=c".into())));
    }
}
