//! `divid.conf` and command-line handling.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use divid_chainstate::{ChainStateOptions, IndexingFlags, StartupOptions};
use divid_consensus::Network;
use divid_log::{self as logging, LogConfig};

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "divid.conf";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    /// Network-specific directory holding `db/` and `blocks/`.
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub log: LogConfig,
    pub chainstate: ChainStateOptions,
    pub startup: StartupOptions,
    pub imports: Vec<PathBuf>,
    pub status: bool,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

/// Settings that take no value on the command line (`--txindex`, `--no-txindex`).
const FLAG_KEYS: &[&str] = &[
    "addressindex",
    "spentindex",
    "txindex",
    "checkscripts",
    "logtimestamps",
    "recoverblockdb",
    "forcestart",
    "status",
];

const VALUE_KEYS: &[&str] = &[
    "datadir",
    "conf",
    "network",
    "backend",
    "loglevel",
    "logformat",
    "debug",
    "par",
    "dbcache",
    "safeshutdown",
    "import",
];

/// Conf and CLI keys compare without case, dashes or underscores.
fn normalize_key(raw: &str) -> String {
    raw.chars()
        .filter(|ch| *ch != '-' && *ch != '_')
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut cli: HashMap<String, Vec<String>> = HashMap::new();
    let mut args = raw_args.into_iter().peekable();

    if let Some(first) = args.peek().map(|value| value.as_str()) {
        match first {
            "help" => return Ok(CliAction::PrintHelp),
            "version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
    }
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
        let Some(name) = arg.strip_prefix("--") else {
            return Err(format!("unexpected argument '{arg}'\n{}", usage()));
        };
        let (name, inline) = match name.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (name, None),
        };
        let key = normalize_key(name);
        if let Some(negated) = key.strip_prefix("no") {
            if FLAG_KEYS.contains(&negated) && inline.is_none() {
                cli.entry(negated.to_string())
                    .or_default()
                    .push("0".to_string());
                continue;
            }
        }
        if FLAG_KEYS.contains(&key.as_str()) {
            cli.entry(key)
                .or_default()
                .push(inline.unwrap_or_else(|| "1".to_string()));
        } else if VALUE_KEYS.contains(&key.as_str()) {
            let value = match inline {
                Some(value) => value,
                None => args
                    .next()
                    .ok_or_else(|| format!("missing value for --{name}\n{}", usage()))?,
            };
            cli.entry(key).or_default().push(value);
        } else {
            return Err(format!("unknown option '--{name}'\n{}", usage()));
        }
    }

    let base_dir = cli
        .get("datadir")
        .and_then(|values| values.last())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = cli
        .get("conf")
        .and_then(|values| values.last())
        .map(PathBuf::from)
        .unwrap_or_else(|| base_dir.join(CONF_FILE_NAME));
    let conf = load_conf(&conf_path)?.unwrap_or_default();
    let settings = Settings {
        cli: &cli,
        conf: &conf,
        conf_path: &conf_path,
    };
    let config = settings.resolve(base_dir, conf_path.clone())?;
    Ok(CliAction::Run(Box::new(config)))
}

/// Command-line values override `divid.conf`; within either source the last
/// occurrence of a key wins.
struct Settings<'a> {
    cli: &'a HashMap<String, Vec<String>>,
    conf: &'a HashMap<String, Vec<String>>,
    conf_path: &'a Path,
}

impl Settings<'_> {
    fn raw(&self, key: &str) -> Option<(&str, &'static str)> {
        if let Some(value) = self.cli.get(key).and_then(|values| values.last()) {
            return Some((value.as_str(), "command line"));
        }
        self.conf
            .get(key)
            .and_then(|values| values.last())
            .map(|value| (value.as_str(), "conf"))
    }

    fn invalid(&self, key: &str, raw: &str, source: &str) -> String {
        if source == "conf" {
            format!("invalid {key} '{raw}' in {}", self.conf_path.display())
        } else {
            format!("invalid value '{raw}' for --{key}\n{}", usage())
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, String> {
        match self.raw(key) {
            None => Ok(default),
            Some((raw, source)) => {
                parse_conf_bool(raw).ok_or_else(|| self.invalid(key, raw, source))
            }
        }
    }

    fn parsed<T>(&self, key: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, String> {
        match self.raw(key) {
            None => Ok(None),
            Some((raw, source)) => parse(raw)
                .map(Some)
                .ok_or_else(|| self.invalid(key, raw, source)),
        }
    }

    /// Every occurrence from both sources, conf first.
    fn all(&self, key: &str) -> Vec<String> {
        let mut values = self.conf.get(key).cloned().unwrap_or_default();
        values.extend(self.cli.get(key).cloned().unwrap_or_default());
        values
    }

    fn resolve(&self, base_dir: PathBuf, conf_path: PathBuf) -> Result<Config, String> {
        let network = self.parsed("network", Network::parse)?.unwrap_or(Network::Mainnet);
        let backend = self.parsed("backend", Backend::parse)?.unwrap_or(Backend::Fjall);
        // A datadir in the conf only applies when the CLI did not pick one.
        let base_dir = if self.cli.contains_key("datadir") {
            base_dir
        } else {
            self.conf
                .get("datadir")
                .and_then(|values| values.last())
                .map(PathBuf::from)
                .unwrap_or(base_dir)
        };
        let data_dir = match network.data_subdir() {
            Some(subdir) => base_dir.join(subdir),
            None => base_dir,
        };

        let log = LogConfig {
            level: self
                .parsed("loglevel", logging::Level::parse)?
                .unwrap_or(logging::Level::Info),
            format: self
                .parsed("logformat", logging::Format::parse)?
                .unwrap_or(logging::Format::Text),
            timestamps: self.flag("logtimestamps", true)?,
            categories: self
                .all("debug")
                .iter()
                .flat_map(|value| value.split(','))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect(),
        };

        let chainstate = ChainStateOptions {
            indexing: IndexingFlags {
                address_index: self.flag("addressindex", false)?,
                spent_index: self.flag("spentindex", false)?,
                tx_index: self.flag("txindex", true)?,
            },
            check_scripts: self.flag("checkscripts", true)?,
            script_threads: self
                .parsed("par", |raw| raw.trim().parse::<usize>().ok())?
                .unwrap_or(0),
            coins_cache_entries: self
                .parsed("dbcache", |raw| {
                    raw.trim().parse::<usize>().ok().filter(|entries| *entries > 0)
                })?
                .unwrap_or(ChainStateOptions::default().coins_cache_entries),
        };

        let startup = StartupOptions {
            recover_block_db: self.flag("recoverblockdb", false)?,
            force_start: self.flag("forcestart", false)?,
            safe_shutdown: self.parsed("safeshutdown", parse_conf_bool)?,
        };

        Ok(Config {
            backend,
            data_dir,
            conf_path,
            network,
            log,
            chainstate,
            startup,
            imports: self.all("import").into_iter().map(PathBuf::from).collect(),
            status: self.flag("status", false)?,
        })
    }
}

/// Reads `key=value` lines; a bare key means `1`. Returns `None` when the
/// file does not exist.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };
    Ok(Some(parse_conf(&contents)))
}

pub fn parse_conf(contents: &str) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(normalize_key(key))
            .or_default()
            .push(value.to_string());
    }
    out
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  divid [options]",
        "  divid <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/divid.conf)",
        "  --network  mainnet|testnet|regtest (default: mainnet)",
        "  --backend  Storage backend to use, fjall|memory (default: fjall)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --debug  Enable debug categories, comma separated (bench, reorg, all)",
        "  --addressindex, --spentindex  Maintain the address and spent indexes",
        "  --no-txindex  Do not maintain the transaction index",
        "  --no-checkscripts  Skip script verification while connecting",
        "  --par  Script-check threads, 0 = one per logical CPU (default: 0)",
        "  --dbcache  Coins cache entries before the cache is flushed (default: 200000)",
        "  --recover-block-db  Rebuild the block tree best block from the coins database",
        "  --force-start  Skip chain-state reconciliation after an unclean shutdown",
        "  --safe-shutdown  Treat the previous shutdown as clean (1) or unclean (0)",
        "  --import  Connect length-prefixed blocks from a file (repeatable)",
        "  --status  Print the chain state as JSON after startup and imports",
        "",
        "Every option may also be set in divid.conf as key=value, e.g. txindex=0.",
    ]
    .join("\n")
}
