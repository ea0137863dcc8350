//! This module defines constants used throughout the solfuzz harness.
//! These constants are related to AFL-style coverage, the environment
//! variables the harness reads, and the fixed shape of every fuzz iteration.

/// The size of the shared memory map used for AFL-style coverage tracking.
/// This value (2^16) is standard for AFL.
pub const EVM_COVERAGE_MAP_SIZE: usize = 65536;

/// When set, the generated Solidity source is written to this path before compilation.
pub const DUMP_PATH_ENV_VAR: &str = "PROTO_FUZZER_DUMP_PATH";

/// When set, the generated Solidity source is replaced by the contents of this file.
pub const LOAD_PATH_ENV_VAR: &str = "SOL_DEBUG_FILE";

/// Run-time override for the compiler binary.
pub const SOLC_PATH_ENV_VAR: &str = "SOLC_PATH";

/// Optional EVM version handed to the compiler and used to configure the engine.
pub const EVM_VERSION_ENV_VAR: &str = "SOLFUZZ_EVM_VERSION";

/// The method every generated contract exposes and every iteration calls.
pub const TEST_METHOD: &str = "test()";

/// Gas handed to every CREATE and CALL: the largest signed 64-bit value.
pub const MAX_GAS: u64 = i64::MAX as u64;

/// Generated programs return zero when every check agrees, ABI-encoded as one word.
pub const EXPECTED_OUTPUT: [u8; 32] = [0; 32];
