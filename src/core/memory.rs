//! In-memory iptables emulation
//!
//! [`MemoryEngine`] implements [`CommandRunner`] by interpreting the subset
//! of iptables, `*-save` and `*-restore` that tunwall issues, against rule
//! tables kept in memory. It backs `tunwall dry-run` and the test suites.
//!
//! All IPv4 binaries (`iptables`, `iptables-nft`, `iptables-legacy`) share one
//! rule set, as do the IPv6 ones, the same way they share the kernel tables.
//! Rules are stored verbatim as given; no normalisation is attempted.
//!
//! Failures can be injected by command-text substring with
//! [`MemoryEngine::fail_when`], and cancellation with
//! [`MemoryEngine::cancel_when`].

use crate::core::error::{Error, Result};
use crate::core::network::AddressFamily;
use crate::core::runner::{CommandRunner, EngineCommand};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

const VERSION_OUTPUT: &str = "iptables v1.8.10 (nf_tables)\n";
const BAD_RULE: &str = "Bad rule (does a matching rule exist in that chain?).";
const NOT_FOUND_EXIT: i32 = 127;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainTable {
    name: String,
    /// `None` for user-defined chains
    policy: Option<String>,
    rules: Vec<String>,
}

impl ChainTable {
    fn builtin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            policy: Some("ACCEPT".to_string()),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RuleTable {
    name: String,
    chains: Vec<ChainTable>,
}

impl RuleTable {
    fn with_chains(name: &str, chains: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            chains: chains.iter().map(|c| ChainTable::builtin(c)).collect(),
        }
    }

    fn chain(&self, name: &str) -> Option<&ChainTable> {
        self.chains.iter().find(|c| c.name == name)
    }

    fn chain_mut(&mut self, name: &str) -> Option<&mut ChainTable> {
        self.chains.iter_mut().find(|c| c.name == name)
    }
}

/// Every table of one address family
#[derive(Debug, Clone, PartialEq, Eq)]
struct RuleSet {
    tables: Vec<RuleTable>,
}

impl RuleSet {
    fn new(with_nat: bool) -> Self {
        let mut tables = vec![RuleTable::with_chains(
            "filter",
            &["INPUT", "FORWARD", "OUTPUT"],
        )];
        if with_nat {
            tables.push(RuleTable::with_chains(
                "nat",
                &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
            ));
        }
        Self { tables }
    }

    fn table(&self, name: &str) -> Option<&RuleTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    fn table_mut(&mut self, name: &str) -> Option<&mut RuleTable> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    /// Renders the rule set in `iptables-save` format.
    fn dump(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push('*');
            out.push_str(&table.name);
            out.push('\n');
            for chain in &table.chains {
                let policy = chain.policy.as_deref().unwrap_or("-");
                out.push_str(&format!(":{} {policy} [0:0]\n", chain.name));
            }
            for chain in &table.chains {
                for rule in &chain.rules {
                    out.push_str(&format!("-A {} {rule}\n", chain.name));
                }
            }
            out.push_str("COMMIT\n");
        }
        out
    }

    /// Parses `iptables-save` output. Only tables present in the input are
    /// returned.
    fn parse(input: &str) -> std::result::Result<Vec<RuleTable>, String> {
        let mut tables = Vec::new();
        let mut current: Option<RuleTable> = None;

        for (index, line) in input.lines().enumerate() {
            let line = line.trim();
            let line_number = index + 1;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('*') {
                if current.is_some() {
                    return Err(format!("line {line_number}: COMMIT expected"));
                }
                current = Some(RuleTable {
                    name: name.to_string(),
                    chains: Vec::new(),
                });
            } else if line == "COMMIT" {
                let table = current
                    .take()
                    .ok_or_else(|| format!("line {line_number}: COMMIT outside a table"))?;
                tables.push(table);
            } else if let Some(rest) = line.strip_prefix(':') {
                let table = current
                    .as_mut()
                    .ok_or_else(|| format!("line {line_number}: chain outside a table"))?;
                let mut parts = rest.split_whitespace();
                let name = parts
                    .next()
                    .ok_or_else(|| format!("line {line_number}: chain name expected"))?;
                let policy = match parts.next() {
                    Some("-") | None => None,
                    Some(policy) => Some(policy.to_string()),
                };
                table.chains.push(ChainTable {
                    name: name.to_string(),
                    policy,
                    rules: Vec::new(),
                });
            } else if let Some(rest) = line.strip_prefix("-A ") {
                let table = current
                    .as_mut()
                    .ok_or_else(|| format!("line {line_number}: rule outside a table"))?;
                let mut parts = rest.split_whitespace();
                let name = parts.next().unwrap_or_default();
                let rule = parts.collect::<Vec<_>>().join(" ");
                table
                    .chain_mut(name)
                    .ok_or_else(|| format!("line {line_number}: unknown chain {name}"))?
                    .rules
                    .push(rule);
            } else {
                return Err(format!("line {line_number}: unexpected input"));
            }
        }

        if current.is_some() {
            return Err("COMMIT expected at end of input".to_string());
        }
        Ok(tables)
    }
}

enum Operation {
    Append(String),
    Insert(String),
    Delete(String),
    Policy(String, String),
    NewChain(String),
}

enum Invocation {
    Rules,
    Save,
    Restore,
}

/// Maps a program name onto the family it manages and the tool it is.
fn classify(program: &str) -> Option<(AddressFamily, Invocation)> {
    let name = program.rsplit('/').next().unwrap_or(program);
    let (base, invocation) = if let Some(base) = name.strip_suffix("-save") {
        (base, Invocation::Save)
    } else if let Some(base) = name.strip_suffix("-restore") {
        (base, Invocation::Restore)
    } else {
        (name, Invocation::Rules)
    };
    let family = match base {
        "iptables" | "iptables-nft" | "iptables-legacy" => AddressFamily::V4,
        "ip6tables" | "ip6tables-nft" | "ip6tables-legacy" => AddressFamily::V6,
        _ => return None,
    };
    Some((family, invocation))
}

const fn family_tool(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::V4 => "iptables",
        AddressFamily::V6 => "ip6tables",
    }
}

#[derive(Debug, Default)]
struct EngineState {
    ipv4: Option<RuleSet>,
    ipv6: Option<RuleSet>,
    /// (command substring, engine output)
    failures: Vec<(String, String)>,
    cancellations: Vec<String>,
    history: Vec<EngineCommand>,
}

impl EngineState {
    fn rules(&self, family: AddressFamily) -> Option<&RuleSet> {
        match family {
            AddressFamily::V4 => self.ipv4.as_ref(),
            AddressFamily::V6 => self.ipv6.as_ref(),
        }
    }

    fn rules_mut(&mut self, family: AddressFamily) -> Option<&mut RuleSet> {
        match family {
            AddressFamily::V4 => self.ipv4.as_mut(),
            AddressFamily::V6 => self.ipv6.as_mut(),
        }
    }
}

/// [`CommandRunner`] that emulates iptables in memory
#[derive(Debug)]
pub struct MemoryEngine {
    state: Mutex<EngineState>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Both families installed, with `filter` and `nat` tables.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState {
                ipv4: Some(RuleSet::new(true)),
                ipv6: Some(RuleSet::new(true)),
                ..EngineState::default()
            }),
        }
    }

    /// No ip6tables binaries at all.
    #[must_use]
    pub fn without_ipv6(self) -> Self {
        self.lock().ipv6 = None;
        self
    }

    /// ip6tables present, but the kernel has no IPv6 `nat` table.
    #[must_use]
    pub fn without_ipv6_nat(self) -> Self {
        if let Some(ipv6) = self.lock().ipv6.as_mut() {
            ipv6.tables.retain(|t| t.name != "nat");
        }
        self
    }

    /// No iptables binaries at all.
    #[must_use]
    pub fn without_ipv4(self) -> Self {
        self.lock().ipv4 = None;
        self
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fails every command whose text contains `pattern`.
    pub fn fail_when(&self, pattern: &str) {
        self.fail_with(pattern, "injected failure");
    }

    /// Like [`MemoryEngine::fail_when`], with the engine output to report.
    pub fn fail_with(&self, pattern: &str, output: &str) {
        self.lock()
            .failures
            .push((pattern.to_string(), output.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Cancels the caller's token when a command containing `pattern` runs.
    pub fn cancel_when(&self, pattern: &str) {
        self.lock().cancellations.push(pattern.to_string());
    }

    /// Policy of a `filter` chain.
    pub fn policy(&self, family: AddressFamily, chain: &str) -> Option<String> {
        self.lock()
            .rules(family)?
            .table("filter")?
            .chain(chain)?
            .policy
            .clone()
    }

    /// Rule specifications of a chain, without the `-A CHAIN` prefix.
    pub fn rules(&self, family: AddressFamily, table: &str, chain: &str) -> Vec<String> {
        self.lock()
            .rules(family)
            .and_then(|rules| rules.table(table))
            .and_then(|table| table.chain(chain))
            .map(|chain| chain.rules.clone())
            .unwrap_or_default()
    }

    /// `iptables-save` output of a family, `None` when it is not installed.
    pub fn dump(&self, family: AddressFamily) -> Option<String> {
        self.lock().rules(family).map(RuleSet::dump)
    }

    /// Every command received so far, including failed ones.
    pub fn commands(&self) -> Vec<EngineCommand> {
        self.lock().history.clone()
    }

    pub fn command_count(&self) -> usize {
        self.lock().history.len()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    fn execute(&self, command: &EngineCommand, cancel: &CancellationToken) -> Result<String> {
        let mut state = self.lock();
        state.history.push(command.clone());
        let text = command.to_string();

        if cancel.is_cancelled() {
            return Err(Error::Cancelled(text));
        }
        if state.cancellations.iter().any(|p| text.contains(p.as_str())) {
            cancel.cancel();
            return Err(Error::Cancelled(text));
        }
        if let Some((_, output)) = state.failures.iter().find(|(p, _)| text.contains(p.as_str())) {
            return Err(Error::CommandFailed {
                command: text,
                output: output.clone(),
                exit_code: Some(1),
            });
        }

        let failed = |output: String, exit_code: i32| Error::CommandFailed {
            command: command.to_string(),
            output,
            exit_code: Some(exit_code),
        };
        let not_found = || failed(format!("{}: command not found", command.program), NOT_FOUND_EXIT);

        let Some((family, invocation)) = classify(&command.program) else {
            return Err(not_found());
        };
        let Some(rules) = state.rules_mut(family) else {
            return Err(not_found());
        };

        match invocation {
            Invocation::Save => Ok(rules.dump()),
            Invocation::Restore => {
                let input = command.stdin.as_deref().unwrap_or_default();
                let tables = RuleSet::parse(input).map_err(|line| {
                    failed(format!("{}-restore: {line}", family_tool(family)), 1)
                })?;
                for table in tables {
                    match rules.table_mut(&table.name) {
                        Some(existing) => *existing = table,
                        None => {
                            return Err(failed(
                                format!(
                                    "{}-restore: unable to initialize table '{}'",
                                    family_tool(family),
                                    table.name
                                ),
                                2,
                            ));
                        }
                    }
                }
                Ok(String::new())
            }
            Invocation::Rules => {
                apply(rules, family, &command.args).map_err(|(output, code)| failed(output, code))
            }
        }
    }
}

/// Applies one iptables invocation. Errors carry the engine output and exit code.
fn apply(
    rules: &mut RuleSet,
    family: AddressFamily,
    args: &[String],
) -> std::result::Result<String, (String, i32)> {
    let tool = family_tool(family);
    let mut table_name = "filter";
    let mut operation = None;
    let mut spec: Vec<&str> = Vec::new();

    let mut iter = args.iter().map(String::as_str);
    while let Some(arg) = iter.next() {
        let mut value = || {
            iter.next()
                .ok_or_else(|| (format!("{tool} v1.8.10: option \"{arg}\" requires an argument"), 2))
        };
        match arg {
            "--version" | "-V" => return Ok(VERSION_OUTPUT.to_string()),
            "-t" | "--table" => table_name = value()?,
            "-A" | "--append" => operation = Some(Operation::Append(value()?.to_string())),
            "-I" | "--insert" => operation = Some(Operation::Insert(value()?.to_string())),
            "-D" | "--delete" => operation = Some(Operation::Delete(value()?.to_string())),
            "-N" | "--new-chain" => operation = Some(Operation::NewChain(value()?.to_string())),
            "-P" | "--policy" => {
                let chain = value()?.to_string();
                let policy = value()?.to_string();
                operation = Some(Operation::Policy(chain, policy));
            }
            other => spec.push(other),
        }
    }

    let Some(operation) = operation else {
        return Err((format!("{tool} v1.8.10: no command specified"), 2));
    };
    let Some(table) = rules.table_mut(table_name) else {
        return Err((
            format!(
                "{tool} v1.8.10 (legacy): can't initialize {tool} table `{table_name}': Table does not exist (do you need to insmod?)"
            ),
            3,
        ));
    };
    let no_chain = || (format!("{tool}: No chain/target/match by that name."), 1);

    match operation {
        Operation::Append(chain) => {
            let chain = table.chain_mut(&chain).ok_or_else(no_chain)?;
            chain.rules.push(spec.join(" "));
        }
        Operation::Insert(chain) => {
            let chain = table.chain_mut(&chain).ok_or_else(no_chain)?;
            // Optional 1-based rule number before the match
            let (position, spec) = match spec.split_first() {
                Some((first, rest)) if first.parse::<usize>().is_ok_and(|n| n > 0) => {
                    (first.parse::<usize>().unwrap_or(1) - 1, rest)
                }
                _ => (0, spec.as_slice()),
            };
            if position > chain.rules.len() {
                return Err((format!("{tool}: Index of insertion too big."), 1));
            }
            chain.rules.insert(position, spec.join(" "));
        }
        Operation::Delete(chain) => {
            let chain = table.chain_mut(&chain).ok_or_else(no_chain)?;
            let index = match spec.as_slice() {
                [number] if number.parse::<usize>().is_ok() => number
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0 && *n <= chain.rules.len())
                    .map(|n| n - 1),
                _ => {
                    let wanted = spec.join(" ");
                    chain.rules.iter().position(|rule| *rule == wanted)
                }
            };
            let index = index.ok_or_else(|| (format!("{tool}: {BAD_RULE}"), 1))?;
            chain.rules.remove(index);
        }
        Operation::NewChain(name) => {
            if table.chain(&name).is_some() {
                return Err((format!("{tool}: Chain already exists."), 1));
            }
            table.chains.push(ChainTable {
                name,
                policy: None,
                rules: Vec::new(),
            });
        }
        Operation::Policy(chain, policy) => {
            if policy != "ACCEPT" && policy != "DROP" {
                return Err((format!("{tool}: Bad policy name. Run `{tool} -h' for help."), 2));
            }
            let chain = table.chain_mut(&chain).ok_or_else(no_chain)?;
            if chain.policy.is_none() {
                return Err((format!("{tool}: Bad built-in chain name"), 1));
            }
            chain.policy = Some(policy);
        }
    }
    Ok(String::new())
}

#[async_trait]
impl CommandRunner for MemoryEngine {
    async fn run(&self, command: &EngineCommand, cancel: &CancellationToken) -> Result<String> {
        self.execute(command, cancel)
    }
}
