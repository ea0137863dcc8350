use build_solc::{SolcLookupOpts, locate_solc};

fn main() {
    locate_solc(SolcLookupOpts {
        binary: "solc",
        override_var: "SOLC_PATH",
        env_var: "SOLC_BINARY_PATH",
    });
}
