//! Block rewards for proof-of-work and proof-of-stake blocks
//!
//! Early proof-of-work blocks pay a randomised subsidy seeded from the
//! previous block hash; after the cutoff height only the minimum subsidy is
//! paid. Proof-of-stake rewards are proportional to the coin age consumed.

use crate::constants::*;
use crate::types::*;

/// Stake reward rate per coin-year in the middle era
const MID_ERA_REWARD_COIN_YEAR: i64 = (2.5 * MAX_MINT_PROOF_OF_STAKE as f64) as i64;

/// Stake reward rate per coin-year outside the middle era (25%)
const REWARD_COIN_YEAR: i64 = 25 * CENT;

const MID_ERA_START: i32 = 500_000;
const MID_ERA_END: i32 = 1_005_000;

/// 32-bit Mersenne Twister (MT19937)
pub struct Mt19937 {
    state: [u32; 624],
    index: usize,
}

impl Mt19937 {
    pub fn new(seed: u32) -> Self {
        let mut state = [0u32; 624];
        state[0] = seed;
        for i in 1..624 {
            let prev = state[i - 1];
            state[i] = 1_812_433_253u32
                .wrapping_mul(prev ^ (prev >> 30))
                .wrapping_add(i as u32);
        }
        Self { state, index: 624 }
    }

    fn twist(&mut self) {
        for i in 0..624 {
            let y = (self.state[i] & 0x8000_0000) | (self.state[(i + 1) % 624] & 0x7fff_ffff);
            let mut next = self.state[(i + 397) % 624] ^ (y >> 1);
            if y & 1 != 0 {
                next ^= 0x9908_b0df;
            }
            self.state[i] = next;
        }
        self.index = 0;
    }

    pub fn next_u32(&mut self) -> u32 {
        if self.index >= 624 {
            self.twist();
        }
        let mut y = self.state[self.index];
        self.index += 1;
        y ^= y >> 11;
        y ^= (y << 7) & 0x9d2c_5680;
        y ^= (y << 15) & 0xefc6_0000;
        y ^= y >> 18;
        y
    }

    /// Uniform integer in `0..=range` by rejection sampling with division
    /// downscaling
    pub fn uniform_inclusive(&mut self, range: u32) -> u32 {
        let buckets = range as u64 + 1;
        let scaling = (u32::MAX as u64 + 1) / buckets;
        let past = buckets * scaling;
        loop {
            let value = self.next_u32() as u64;
            if value < past {
                return (value / scaling) as u32;
            }
        }
    }
}

/// Seed for the PoW bonus: seven hex digits of the previous hash's display
/// form starting at offset 15
pub fn pow_bonus_seed(prev_hash: &Hash) -> u32 {
    let display = hash_to_hex(prev_hash);
    u32::from_str_radix(&display[15..22], 16).unwrap_or(0)
}

/// GetProofOfWorkReward: ℤ × ℕ × ℍ → ℤ
///
/// 1. Height 1 pays 0.99% of the launch money cap
/// 2. Past POW_CUTOFF_HEIGHT only MIN_POW_SUBSIDY is paid
/// 3. Otherwise BASE_POW_SUBSIDY plus a bonus of 0..=200000 coins drawn
///    from MT19937 seeded by the previous block hash
///
/// Fees are always added.
pub fn proof_of_work_reward(fees: Amount, height: i32, prev_hash: &Hash) -> Amount {
    if height == 1 {
        return (0.0099 * OLD_MAX_MONEY as f64) as Amount + fees;
    }
    if height > POW_CUTOFF_HEIGHT {
        return MIN_POW_SUBSIDY + fees;
    }
    let mut rng = Mt19937::new(pow_bonus_seed(prev_hash));
    let bonus = rng.uniform_inclusive(POW_BONUS_RANGE) as Amount * COIN;
    BASE_POW_SUBSIDY + bonus + fees
}

/// GetProofOfStakeReward: ℕ × ℕ × ℤ → ℤ
///
/// `coin_age` in coin-days, `money_supply` at the current tip.
/// 1. Nothing is minted once the supply is exactly MAX_MONEY
/// 2. Heights in (500000, 1005000) use the middle-era rate, whose
///    next-supply guard compares whole coins against MAX_MONEY
/// 3. Other heights use 25% per coin-year
/// 4. From 1005000 on, the subsidy is clipped so supply stops at MAX_MONEY
pub fn proof_of_stake_reward(coin_age: i64, height: i32, money_supply: Amount) -> Amount {
    if money_supply == MAX_MONEY {
        return 0;
    }

    if height > MID_ERA_START && height < MID_ERA_END {
        let mut reward_coin_year = MID_ERA_REWARD_COIN_YEAR;
        let next_money = money_supply / COIN + reward_coin_year;
        if next_money > MAX_MONEY {
            let difference = next_money - MAX_MONEY;
            reward_coin_year = next_money - difference;
        }
        if next_money == MAX_MONEY {
            reward_coin_year = 0;
        }
        return coin_age.saturating_mul(reward_coin_year) / 365;
    }

    let mut subsidy = coin_age.saturating_mul(REWARD_COIN_YEAR) / 365;
    if height >= MID_ERA_END {
        let next_money = money_supply + subsidy;
        if next_money > MAX_MONEY {
            subsidy -= next_money - MAX_MONEY;
        }
    }
    subsidy
}
