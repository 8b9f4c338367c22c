//! Well-known per-network values for the Solana deployments x402 targets.

use solana_pubkey::{Pubkey, pubkey};
use x402_types::proto::Network;

/// USDC mint on mainnet-beta.
pub const USDC_MAINNET: Pubkey = pubkey!("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v");
/// USDC mint used by the devnet deployment.
pub const USDC_DEVNET: Pubkey = pubkey!("4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU");

/// Number of decimals USDC uses on every network.
pub const USDC_DECIMALS: u8 = 6;

/// Per-network defaults for a [`Network`].
///
/// ```
/// use x402_chain_solana::KnownNetworkSolana;
/// use x402_types::proto::Network;
///
/// assert_eq!(Network::Devnet.default_rpc_url(), "https://api.devnet.solana.com");
/// ```
pub trait KnownNetworkSolana {
    fn usdc_mint(&self) -> Pubkey;
    fn default_rpc_url(&self) -> &'static str;
}

impl KnownNetworkSolana for Network {
    fn usdc_mint(&self) -> Pubkey {
        match self {
            Network::MainnetBeta => USDC_MAINNET,
            // A local validator is usually seeded from devnet state.
            Network::Devnet | Network::Localnet => USDC_DEVNET,
        }
    }

    fn default_rpc_url(&self) -> &'static str {
        match self {
            Network::MainnetBeta => "https://api.mainnet-beta.solana.com",
            Network::Devnet => "https://api.devnet.solana.com",
            Network::Localnet => "http://127.0.0.1:8899",
        }
    }
}

/// Formats base units of USDC for display, e.g. `50000` as `"0.05 USDC"`.
pub fn format_usdc(amount: u64) -> String {
    let scale = 10u64.pow(USDC_DECIMALS as u32);
    let whole = amount / scale;
    let fraction = amount % scale;
    if fraction == 0 {
        return format!("{whole} USDC");
    }
    let fraction = format!("{fraction:06}");
    let fraction = fraction.trim_end_matches('0');
    format!("{whole}.{fraction} USDC")
}
