//! Consensus and policy constants for the hybrid PoW/PoS chain

use crate::types::Amount;

/// Base units per coin
pub const COIN: Amount = 1_000_000;

/// One hundredth of a coin
pub const CENT: Amount = 10_000;

/// Hard cap on money supply: 25 billion coins
pub const MAX_MONEY: Amount = 25_000_000_000 * COIN;

/// Supply cap used by the launch-era rewards
pub const OLD_MAX_MONEY: Amount = 50_000_000_000 * COIN;

/// Annual stake mint unit (0.1 coin)
pub const MAX_MINT_PROOF_OF_STAKE: Amount = COIN / 10;

/// Fee allowance added on top of the stake reward entitlement
pub const DEFAULT_TRANSACTION_MINFEE: Amount = 1000;

/// Minimum subsidy after the PoW cutoff height
pub const MIN_POW_SUBSIDY: Amount = COIN;

/// Base PoW subsidy before the random bonus
pub const BASE_POW_SUBSIDY: Amount = 100_000 * COIN;

/// Upper bound (inclusive) of the random PoW bonus, in coins
pub const POW_BONUS_RANGE: u32 = 200_000;

/// Height after which PoW only pays the minimum subsidy
pub const POW_CUTOFF_HEIGHT: i32 = 86_400;

/// Required confirmations before a coinbase/coinstake output is spendable
pub const COINBASE_MATURITY: i32 = 30;

/// Maturity is only enforced once the tip has passed this height
pub const MATURITY_ENFORCEMENT_HEIGHT: i32 = 1_600_000;

/// Lock time threshold: values below are heights, above are timestamps
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number for final transaction inputs
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// BIP68: if set, the sequence number carries no relative lock
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;

/// BIP68: if set, the relative lock is time based
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;

/// BIP68: mask extracting the relative lock value
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;

/// BIP68: time locks are expressed in units of 2^9 = 512 seconds
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Lock time flag: evaluate BIP68 sequence locks
pub const LOCKTIME_VERIFY_SEQUENCE: u32 = 1 << 0;

/// Lock time flag: use median-time-past instead of block time
pub const LOCKTIME_MEDIAN_TIME_PAST: u32 = 1 << 1;

/// Lock time flags used for mempool admission
pub const STANDARD_LOCKTIME_VERIFY_FLAGS: u32 = LOCKTIME_VERIFY_SEQUENCE | LOCKTIME_MEDIAN_TIME_PAST;

/// Maximum serialized block size
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Maximum signature operations per block
pub const MAX_BLOCK_SIGOPS: u32 = (MAX_BLOCK_SIZE / 50) as u32;

/// Maximum signature operations in a standard transaction
pub const MAX_STANDARD_TX_SIGOPS: u32 = MAX_BLOCK_SIGOPS / 5;

/// Maximum size of a standard transaction
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// Default sigop density limit (bytes per sigop)
pub const DEFAULT_BYTES_PER_SIGOP: u32 = 20;

/// Largest standard scriptSig
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;

/// Largest standard bare multisig
pub const MAX_STANDARD_MULTISIG_KEYS: usize = 3;

/// Largest standard OP_RETURN payload script
pub const MAX_OP_RETURN_RELAY: usize = 83;

/// Mempool entries with this height are unconfirmed
pub const MEMPOOL_HEIGHT: u32 = 0x7FFF_FFFF;

/// Default mempool ceiling in megabytes
pub const DEFAULT_MAX_MEMPOOL_SIZE: u64 = 300;

/// Default mempool expiry in hours
pub const DEFAULT_MEMPOOL_EXPIRY: u64 = 72;

/// Default in-pool ancestor count limit
pub const DEFAULT_ANCESTOR_LIMIT: u64 = 25;

/// Default in-pool ancestor size limit in kilobytes
pub const DEFAULT_ANCESTOR_SIZE_LIMIT: u64 = 101;

/// Default in-pool descendant count limit
pub const DEFAULT_DESCENDANT_LIMIT: u64 = 25;

/// Default in-pool descendant size limit in kilobytes
pub const DEFAULT_DESCENDANT_SIZE_LIMIT: u64 = 101;

/// Half-life of the rolling minimum fee, in seconds
pub const ROLLING_FEE_HALFLIFE: i64 = 60 * 60 * 12;

/// Default free-relay allowance (thousand bytes per minute)
pub const DEFAULT_LIMITFREERELAY: f64 = 15.0;

/// Floor of the free-relay allowance under congestion
pub const DEFAULT_MIN_LIMITFREERELAY: f64 = 1.0;

/// Starting fee cutoff in base units per byte
pub const DEFAULT_MINLIMITERTXFEE: f64 = 1.0;

/// Ceiling of the fee cutoff in base units per byte
pub const DEFAULT_MAXLIMITERTXFEE: f64 = 3.0;

/// Pool occupancy (in blocks) at which the fee cutoff saturates
pub const MAX_BLOCK_SIZE_MULTIPLIER: u64 = 3;

/// Default minimum relay fee per kilobyte
pub const DEFAULT_MIN_RELAY_TX_FEE: Amount = 1000;

/// Relay free transactions only with sufficient priority by default
pub const DEFAULT_RELAYPRIORITY: bool = true;

/// Flat absurd-fee threshold for version 2 transactions
pub const ABSURD_FEE_V2: Amount = 100_000_000;

/// Multiplier on the relay fee defining an absurd fee for version 1
pub const ABSURD_FEE_MULTIPLIER: Amount = 10_000;

/// Seconds between block index writes
pub const DATABASE_WRITE_INTERVAL: i64 = 60 * 60;

/// Seconds between full coin cache flushes
pub const DATABASE_FLUSH_INTERVAL: i64 = 24 * 60 * 60;

/// Maximum size of a blk?????.dat file
pub const MAX_BLOCKFILE_SIZE: u32 = 0x0800_0000;

/// Pre-allocation chunk for block files
pub const BLOCKFILE_CHUNK_SIZE: u32 = 0x0100_0000;

/// Pre-allocation chunk for undo files
pub const UNDOFILE_CHUNK_SIZE: u32 = 0x0010_0000;

/// Minimum free disk space kept in reserve
pub const MIN_DISK_SPACE: u64 = 52_428_800;

/// Blocks this far past the tip are not stored unless requested
pub const MIN_BLOCKS_TO_KEEP: i32 = 288;

/// Default coin cache budget in bytes
pub const DEFAULT_COIN_CACHE_USAGE: usize = 300 << 20;

/// Maximum number of orphan transactions kept in memory
pub const DEFAULT_MAX_ORPHAN_TRANSACTIONS: usize = 100;

/// Orphans larger than this are not stored
pub const MAX_ORPHAN_TX_SIZE: usize = 100_000;

/// Seconds an orphan may wait for its parents
pub const ORPHAN_TX_EXPIRE_TIME: i64 = 20 * 60;

/// Number of blocks in the median-time-past window
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum drift of a header timestamp into the future
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

/// Median time past after which the target spacing drops to 150 seconds
pub const SERVICE_UPGRADE_HARDFORK: i64 = 1_525_478_400;

/// Target spacing after the service upgrade
pub const SERVICE_UPGRADE_TARGET_SPACING: i64 = 150;

/// Maximum size of a script
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a pushed stack element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum non-push operations per script
pub const MAX_OPS_PER_SCRIPT: usize = 201;

/// Maximum combined main and alt stack depth
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum keys in a CHECKMULTISIG
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Seconds in a day, used by coin age
pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
