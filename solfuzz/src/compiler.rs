//! The compilation wrapper.
//!
//! [`Solc`] drives `solc --standard-json` as a child process. A request names
//! the source, the contract to extract, the addresses of already deployed
//! libraries and the optimiser level; the result is the contract's bytecode
//! plus its method-identifier table.
//!
//! The compiler's "stack too deep" limitation is a known, tolerated outcome and
//! comes back as [`CompileOutcome::StackTooDeep`]. Internal compiler errors and
//! a crashing compiler process are returned as [`CompilerFault`] errors so the
//! driver can report them as findings.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use revm::primitives::{Address, Bytes, U256};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::evm::EvmVersion;

/// Length of a library placeholder (`__$<34 hex chars>$__`) inside a hex object.
const PLACEHOLDER_HEX_LEN: usize = 40;

/// A 4-byte method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selector(pub [u8; 4]);

impl Selector {
    /// The selector followed by `args`, each ABI-encoded as one big-endian word.
    pub fn calldata(&self, args: &[U256]) -> Bytes {
        let mut data = Vec::with_capacity(4 + 32 * args.len());
        data.extend_from_slice(&self.0);
        for arg in args {
            data.extend_from_slice(&arg.to_be_bytes::<32>());
        }
        data.into()
    }
}

impl FromStr for Selector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .with_context(|| format!("Selector `{s}` is not hex"))?;
        let bytes: [u8; 4] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow::anyhow!("Selector must be 4 bytes, got {}", b.len()))?;
        Ok(Selector(bytes))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Optimiser levels the harness can request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OptimiserSettings {
    /// The compiler's always-on steps only; the optimiser itself is disabled.
    #[default]
    Minimal,
    /// `enabled: true` with the compiler's standard step sequence.
    Standard,
    /// Every optimiser component switched on.
    Full,
}

impl OptimiserSettings {
    fn to_json(self) -> Value {
        match self {
            OptimiserSettings::Minimal => json!({ "enabled": false }),
            OptimiserSettings::Standard => json!({ "enabled": true, "runs": 200 }),
            OptimiserSettings::Full => json!({
                "enabled": true,
                "runs": 200,
                "details": {
                    "peephole": true,
                    "inliner": true,
                    "jumpdestRemover": true,
                    "orderLiterals": true,
                    "deduplicate": true,
                    "cse": true,
                    "constantOptimizer": true,
                    "yul": true
                }
            }),
        }
    }
}

/// Everything one compiler invocation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileRequest {
    /// Name of the single source unit.
    pub source_name: String,
    pub source: String,
    /// `file:Name`, `:Name` or `Name`. Empty selects the last-declared contract.
    pub contract: String,
    /// Library name to deployed address.
    pub libraries: BTreeMap<String, Address>,
    pub optimiser: OptimiserSettings,
    /// `None` keeps the compiler's default target.
    pub evm_version: Option<EvmVersion>,
}

impl CompileRequest {
    pub fn new(source_name: &str, source: &str, contract: &str) -> Self {
        Self {
            source_name: source_name.to_string(),
            source: source.to_string(),
            contract: contract.to_string(),
            libraries: BTreeMap::new(),
            optimiser: OptimiserSettings::default(),
            evm_version: None,
        }
    }

    /// The `solc --standard-json` input for this request.
    pub fn to_standard_json(&self) -> Value {
        let libraries: serde_json::Map<String, Value> = self
            .libraries
            .iter()
            .map(|(name, address)| {
                (
                    name.clone(),
                    Value::String(format!("0x{}", hex::encode(address))),
                )
            })
            .collect();

        let mut settings = json!({
            "optimizer": self.optimiser.to_json(),
            "outputSelection": {
                "*": {
                    "*": [
                        "evm.bytecode.object",
                        "evm.bytecode.linkReferences",
                        "evm.methodIdentifiers"
                    ],
                    "": ["ast"]
                }
            }
        });
        if !libraries.is_empty() {
            let mut by_source = serde_json::Map::new();
            by_source.insert(self.source_name.clone(), Value::Object(libraries));
            settings["libraries"] = Value::Object(by_source);
        }
        if let Some(version) = self.evm_version {
            settings["evmVersion"] = Value::String(version.as_str().to_string());
        }

        let mut sources = serde_json::Map::new();
        sources.insert(
            self.source_name.clone(),
            json!({ "content": self.source.as_str() }),
        );

        json!({
            "language": "Solidity",
            "sources": sources,
            "settings": settings
        })
    }
}

/// Bytecode of one contract plus its selector table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilationResult {
    pub bytecode: Vec<u8>,
    /// Textual signature (`test()`) to selector.
    pub method_identifiers: BTreeMap<String, Selector>,
    /// Library names the compiler reported as needing link-time addresses.
    pub link_references: Vec<String>,
    /// Byte offsets of placeholders still present in [`Self::bytecode`] (zero-filled).
    pub unresolved_placeholders: Vec<usize>,
}

impl CompilationResult {
    /// The sentinel returned in place of a tolerated compiler limitation.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.bytecode.is_empty() && self.method_identifiers.is_empty()
    }

    /// No library placeholder is left in the bytecode.
    pub fn is_linked(&self) -> bool {
        self.unresolved_placeholders.is_empty()
    }

    pub fn selector(&self, signature: &str) -> Option<Selector> {
        self.method_identifiers.get(signature).copied()
    }
}

/// The result of a compile call that did not hit an internal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled(CompilationResult),
    /// The code generator ran out of reachable stack slots.
    StackTooDeep,
}

impl CompileOutcome {
    /// Collapses the tolerated limitation into the empty `(bytecode, selectors)` sentinel.
    pub fn into_result(self) -> CompilationResult {
        match self {
            CompileOutcome::Compiled(result) => result,
            CompileOutcome::StackTooDeep => CompilationResult::empty(),
        }
    }
}

/// The compiler failed in a way that is never expected from valid input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CompilerFault {
    pub kind: String,
    pub message: String,
}

/// Anything able to turn a [`CompileRequest`] into bytecode.
pub trait Compiler {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutcome>;
}

/// `solc` invoked through its standard-JSON interface.
#[derive(Debug, Clone)]
pub struct Solc {
    path: PathBuf,
}

impl Solc {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the first line of `solc --version` output that carries the version.
    pub fn version(&self) -> Result<String> {
        let output = Command::new(&self.path)
            .arg("--version")
            .output()
            .with_context(|| format!("Failed to execute {}", self.path.display()))?;
        if !output.status.success() {
            bail!("{} --version exited with {}", self.path.display(), output.status);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .find(|line| line.starts_with("Version"))
            .unwrap_or_else(|| stdout.trim())
            .to_string())
    }

    fn invoke(&self, input: &Value) -> Result<String> {
        let mut child = Command::new(&self.path)
            .arg("--standard-json")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {}", self.path.display()))?;

        child
            .stdin
            .take()
            .context("Compiler stdin is not available")?
            .write_all(serde_json::to_string(input)?.as_bytes())
            .context("Failed to send the standard-json input to the compiler")?;

        let output = child
            .wait_with_output()
            .context("Failed to wait for the compiler")?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(CompilerFault {
                kind: "CompilerProcess".to_string(),
                message: format!(
                    "{} exited with {}: {}",
                    self.path.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }
            .into());
        }
        String::from_utf8(output.stdout).context("Compiler output is not UTF-8")
    }
}

impl Compiler for Solc {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutcome> {
        let output = self.invoke(&request.to_standard_json())?;
        parse_standard_json_output(&output, &request.contract)
    }
}

#[derive(Debug, Deserialize)]
struct StandardJsonOutput {
    #[serde(default)]
    errors: Vec<Diagnostic>,
    #[serde(default)]
    sources: BTreeMap<String, SourceOutput>,
    #[serde(default)]
    contracts: BTreeMap<String, BTreeMap<String, ContractOutput>>,
}

#[derive(Debug, Deserialize)]
struct Diagnostic {
    #[serde(rename = "type")]
    kind: String,
    severity: String,
    message: String,
    #[serde(rename = "formattedMessage")]
    formatted_message: Option<String>,
}

impl Diagnostic {
    fn is_error(&self) -> bool {
        self.severity == "error"
    }

    fn is_stack_too_deep(&self) -> bool {
        self.is_error() && !self.is_fault() && self.message.contains("too deep")
    }

    fn is_fault(&self) -> bool {
        matches!(self.kind.as_str(), "InternalCompilerError" | "Exception")
    }
}

#[derive(Debug, Deserialize)]
struct SourceOutput {
    ast: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ContractOutput {
    evm: Option<EvmOutput>,
}

#[derive(Debug, Deserialize)]
struct EvmOutput {
    bytecode: Option<BytecodeOutput>,
    #[serde(rename = "methodIdentifiers", default)]
    method_identifiers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct BytecodeOutput {
    #[serde(default)]
    object: String,
    #[serde(rename = "linkReferences", default)]
    link_references: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Interprets `solc --standard-json` output for the contract named by `selector`.
pub fn parse_standard_json_output(output: &str, selector: &str) -> Result<CompileOutcome> {
    let output: StandardJsonOutput =
        serde_json::from_str(output).context("Malformed compiler output")?;

    if let Some(fault) = output.errors.iter().find(|d| d.is_fault()) {
        return Err(CompilerFault {
            kind: fault.kind.clone(),
            message: fault.message.clone(),
        }
        .into());
    }

    if output.errors.iter().any(Diagnostic::is_stack_too_deep) {
        debug!("Compiler hit the stack depth limitation");
        return Ok(CompileOutcome::StackTooDeep);
    }

    if output.errors.iter().any(Diagnostic::is_error) {
        for diagnostic in output.errors.iter().filter(|d| d.is_error()) {
            eprintln!(
                "{}",
                diagnostic
                    .formatted_message
                    .as_deref()
                    .unwrap_or(&diagnostic.message)
            );
        }
        eprintln!("Compiling contract failed");
    }

    let Some((source, name)) = resolve_contract(&output, selector) else {
        warn!(selector, "Compiler produced no object for the requested contract");
        return Ok(CompileOutcome::Compiled(CompilationResult::empty()));
    };
    let Some(evm) = output
        .contracts
        .get(&source)
        .and_then(|contracts| contracts.get(&name))
        .and_then(|contract| contract.evm.as_ref())
    else {
        warn!(%source, %name, "Contract carries no EVM output");
        return Ok(CompileOutcome::Compiled(CompilationResult::empty()));
    };

    let mut result = CompilationResult::empty();
    if let Some(bytecode) = &evm.bytecode {
        let (code, placeholders) = decode_object(&bytecode.object)?;
        result.bytecode = code;
        result.unresolved_placeholders = placeholders;
        result.link_references = bytecode
            .link_references
            .values()
            .flat_map(|libraries| libraries.keys().cloned())
            .collect();
    }
    for (signature, selector) in &evm.method_identifiers {
        result
            .method_identifiers
            .insert(signature.clone(), selector.parse()?);
    }
    Ok(CompileOutcome::Compiled(result))
}

/// Finds `(source unit, contract name)` for a selector.
fn resolve_contract(output: &StandardJsonOutput, selector: &str) -> Option<(String, String)> {
    if selector.is_empty() {
        return last_declared_contract(output);
    }
    let (source, name) = selector.rsplit_once(':').unwrap_or(("", selector));
    if !source.is_empty() {
        return Some((source.to_string(), name.to_string()));
    }
    output
        .contracts
        .iter()
        .find(|(_, contracts)| contracts.contains_key(name))
        .map(|(source, _)| (source.clone(), name.to_string()))
}

/// The contract defined last in source order, across source units in name order.
fn last_declared_contract(output: &StandardJsonOutput) -> Option<(String, String)> {
    output
        .sources
        .iter()
        .filter_map(|(source, unit)| {
            let nodes = unit.ast.as_ref()?.get("nodes")?.as_array()?;
            let name = nodes
                .iter()
                .filter(|node| {
                    node.get("nodeType").and_then(Value::as_str) == Some("ContractDefinition")
                })
                .filter_map(|node| node.get("name").and_then(Value::as_str))
                .last()?;
            Some((source.clone(), name.to_string()))
        })
        .last()
}

/// Decodes a hex object, zero-filling library placeholders and recording their byte offsets.
pub fn decode_object(object: &str) -> Result<(Vec<u8>, Vec<usize>)> {
    let object = object.trim_start_matches("0x");
    let mut cleaned = String::with_capacity(object.len());
    let mut placeholders = Vec::new();
    let mut rest = object;
    while let Some(start) = rest.find("__") {
        if rest.len() < start + PLACEHOLDER_HEX_LEN {
            bail!("Truncated library placeholder in compiler object");
        }
        cleaned.push_str(&rest[..start]);
        placeholders.push(cleaned.len() / 2);
        cleaned.push_str(&"0".repeat(PLACEHOLDER_HEX_LEN));
        rest = &rest[start + PLACEHOLDER_HEX_LEN..];
    }
    cleaned.push_str(rest);
    let code = hex::decode(&cleaned).context("Compiler object is not valid hex")?;
    Ok((code, placeholders))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn output_with(errors: Value, contracts: Value, sources: Value) -> String {
        json!({ "errors": errors, "contracts": contracts, "sources": sources }).to_string()
    }

    fn contract(object: &str, ids: Value) -> Value {
        json!({
            "evm": {
                "bytecode": { "object": object, "linkReferences": {} },
                "methodIdentifiers": ids
            }
        })
    }

    #[test]
    fn stack_too_deep_becomes_the_empty_sentinel() {
        let output = output_with(
            json!([{
                "type": "CompilerError",
                "severity": "error",
                "component": "general",
                "message": "Stack too deep. Try compiling with `--via-ir` (cli) or the equivalent `viaIR: true` (standard JSON) while enabling the optimizer.",
                "formattedMessage": "CompilerError: Stack too deep."
            }]),
            json!({}),
            json!({}),
        );
        let outcome = parse_standard_json_output(&output, "fuzz.sol:C").unwrap();
        assert_eq!(outcome, CompileOutcome::StackTooDeep);

        let result = outcome.into_result();
        assert!(result.bytecode.is_empty());
        assert!(result.method_identifiers.is_empty());
    }

    #[test]
    fn yul_stack_errors_are_also_tolerated() {
        let output = output_with(
            json!([{
                "type": "YulException",
                "severity": "error",
                "message": "Variable var_a is 1 slot(s) too deep inside the stack."
            }]),
            json!({}),
            json!({}),
        );
        assert_eq!(
            parse_standard_json_output(&output, "").unwrap(),
            CompileOutcome::StackTooDeep
        );
    }

    #[test]
    fn internal_compiler_errors_are_faults() {
        let output = output_with(
            json!([{
                "type": "InternalCompilerError",
                "severity": "error",
                "message": "Assertion failed"
            }]),
            json!({}),
            json!({}),
        );
        let err = parse_standard_json_output(&output, "C").unwrap_err();
        let fault = err.downcast::<CompilerFault>().unwrap();
        assert_eq!(fault.kind, "InternalCompilerError");
    }

    #[test]
    fn compile_errors_still_yield_an_object_request() {
        let output = output_with(
            json!([{
                "type": "TypeError",
                "severity": "error",
                "message": "Undeclared identifier."
            }]),
            json!({}),
            json!({}),
        );
        let outcome = parse_standard_json_output(&output, "fuzz.sol:C").unwrap();
        assert_matches!(outcome, CompileOutcome::Compiled(result) if result.is_empty());
    }

    #[test]
    fn selects_the_named_contract_and_its_selectors() {
        let output = output_with(
            json!([{ "type": "Warning", "severity": "warning", "message": "Unused." }]),
            json!({
                "fuzz.sol": {
                    "C": contract("6080", json!({ "test()": "f8a8fd6d" })),
                    "L": contract("60fe", json!({}))
                }
            }),
            json!({}),
        );
        for selector in ["fuzz.sol:C", ":C", "C"] {
            let result = parse_standard_json_output(&output, selector)
                .unwrap()
                .into_result();
            assert_eq!(result.bytecode, vec![0x60, 0x80]);
            assert_eq!(
                result.selector("test()"),
                Some(Selector([0xf8, 0xa8, 0xfd, 0x6d]))
            );
        }
    }

    #[test]
    fn empty_selector_picks_the_last_declared_contract() {
        // Alphabetical map order would pick `Z`; source order says `A` came last.
        let output = output_with(
            json!([]),
            json!({
                "fuzz.sol": {
                    "A": contract("01", json!({})),
                    "Z": contract("02", json!({}))
                }
            }),
            json!({
                "fuzz.sol": {
                    "ast": {
                        "nodeType": "SourceUnit",
                        "nodes": [
                            { "nodeType": "PragmaDirective" },
                            { "nodeType": "ContractDefinition", "name": "Z" },
                            { "nodeType": "ContractDefinition", "name": "A" }
                        ]
                    }
                }
            }),
        );
        let result = parse_standard_json_output(&output, "").unwrap().into_result();
        assert_eq!(result.bytecode, vec![0x01]);
    }

    #[test]
    fn placeholders_are_zero_filled_and_recorded() {
        let object = format!("6073{}6000", "__$0123456789abcdef0123456789abcdef01$__");
        let (code, placeholders) = decode_object(&object).unwrap();
        assert_eq!(placeholders, vec![2]);
        assert_eq!(code.len(), 2 + 20 + 2);
        assert!(code[2..22].iter().all(|&b| b == 0));

        let (_, none) = decode_object("0x6080604052").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn request_carries_libraries_and_evm_version() {
        let mut request = CompileRequest::new("fuzz.sol", "contract C {}", "fuzz.sol:C");
        request
            .libraries
            .insert("L".to_string(), Address::repeat_byte(0xab));
        request.evm_version = Some(EvmVersion::Shanghai);
        let input = request.to_standard_json();

        assert_eq!(
            input["settings"]["libraries"]["fuzz.sol"]["L"],
            json!(format!("0x{}", "ab".repeat(20)))
        );
        assert_eq!(input["settings"]["evmVersion"], json!("shanghai"));
        assert_eq!(input["settings"]["optimizer"]["enabled"], json!(false));
        assert_eq!(input["sources"]["fuzz.sol"]["content"], json!("contract C {}"));
    }

    #[test]
    fn selector_parses_and_builds_calldata() {
        let selector: Selector = "0xf8a8fd6d".parse().unwrap();
        assert_eq!(selector.to_string(), "0xf8a8fd6d");
        assert_eq!(selector.calldata(&[]).to_vec(), vec![0xf8, 0xa8, 0xfd, 0x6d]);

        let with_arg = selector.calldata(&[U256::from(1)]);
        assert_eq!(with_arg.len(), 36);
        assert_eq!(with_arg[35], 1);
        assert!("f8a8fd".parse::<Selector>().is_err());
    }
}
