//! Attribution ranking and fair credit allocation.
//!
//! Credit weights are computed as exact rationals so the allocated integer
//! vector always sums to the requested value; floating-point summation can
//! drop or add a unit.

use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Signed, ToPrimitive, Zero};

use crate::{
    error::AttributionError,
    events::impression::Impression,
    pds::traits::{draw_unit, UnitRng},
};

/// Sorts `pool` into last-N-touch order (priority descending, then most
/// recent first; ties keep arrival order) and truncates it to at most
/// `credit_len` impressions.
pub fn rank_last_n_touch(pool: &mut Vec<Impression>, credit_len: usize) {
    pool.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.timestamp.cmp(&a.timestamp))
    });
    pool.truncate(credit_len.min(pool.len()));
}

/// Distributes `value` over the retained impressions proportionally to
/// `credit`, producing an integer vector that sums to exactly `value`.
///
/// Each weight `value * credit[i] / sum(credit)` is rounded up or down by a
/// pairwise randomized walk that keeps the running sum intact and leaves
/// every entry's expectation equal to its real-valued weight. With exact
/// rational weights the final vector is integral without any residual
/// correction.
pub fn fairly_allocate_credit(
    credit: &[f64],
    value: u32,
    rng: &mut dyn UnitRng,
) -> Result<Vec<u32>, AttributionError> {
    if credit.is_empty() {
        return Err(AttributionError::InvalidState(
            "credit allocation over an empty pool".into(),
        ));
    }

    let rationals = credit
        .iter()
        .map(|c| {
            BigRational::from_float(*c)
                .filter(|r| r.is_positive())
                .ok_or_else(|| {
                    AttributionError::InvalidState(format!(
                        "non-positive credit entry {c}"
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let total: BigRational = rationals.iter().sum();
    let value_rational = BigRational::from_integer(BigInt::from(value));

    let mut weights: Vec<BigRational> = rationals
        .into_iter()
        .map(|c| c * &value_rational / &total)
        .collect();

    let mut leader = 0;
    for i in 1..weights.len() {
        let frac_leader = fractional_part(&weights[leader]);
        let frac_i = fractional_part(&weights[i]);
        if frac_leader.is_zero() && frac_i.is_zero() {
            continue;
        }

        // Residuals toward the pair's common rounding direction: up when
        // the fractions jointly exceed one unit, down otherwise.
        let one = BigRational::one();
        let (delta_leader, delta_i) = if &frac_leader + &frac_i > one {
            (&one - &frac_leader, &one - &frac_i)
        } else {
            (-frac_leader, -frac_i)
        };

        let p_switch = &delta_i / (&delta_leader + &delta_i);
        let draw = BigRational::from_float(draw_unit(rng)?).ok_or_else(|| {
            AttributionError::InvalidState("rng draw is not finite".into())
        })?;

        if draw < p_switch {
            // The old leader becomes integral; index i carries the
            // combined fractional mass onward.
            weights[leader] = weights[leader].clone() + &delta_leader;
            weights[i] = weights[i].clone() - &delta_leader;
            leader = i;
        } else {
            weights[i] = weights[i].clone() + &delta_i;
            weights[leader] = weights[leader].clone() - &delta_i;
        }
    }

    weights
        .into_iter()
        .map(|w| {
            if !w.is_integer() || w.is_negative() {
                return Err(AttributionError::InvalidState(format!(
                    "allocated credit {w} is not a non-negative integer"
                )));
            }
            w.to_integer().to_u32().ok_or_else(|| {
                AttributionError::InvalidState(
                    "allocated credit overflows u32".into(),
                )
            })
        })
        .collect()
}

fn fractional_part(w: &BigRational) -> BigRational {
    w - w.floor()
}

/// Builds the output histogram: slot `histogram_index` of each retained
/// impression accumulates its allocated credit. Indices at or past
/// `histogram_size` contribute nothing; such impressions were admitted
/// under a larger configured size that has since shrunk.
pub fn fill_histogram(
    retained: &[Impression],
    allocated: &[u32],
    histogram_size: usize,
) -> Vec<u32> {
    let mut histogram = vec![0u32; histogram_size];
    for (impression, credit) in retained.iter().zip(allocated) {
        if let Some(slot) = histogram.get_mut(impression.histogram_index) {
            *slot += credit;
        }
    }
    histogram
}
