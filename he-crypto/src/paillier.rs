//! Paillier cryptosystem over arbitrary-precision integers.
//!
//! The additive law is what the exchange relies on:
//!
//! `decrypt(c1 * c2 mod n^2) = (decrypt(c1) + decrypt(c2)) mod n`
//!
//! so a hospital can multiply a patient's ciphertexts together and decrypt a
//! single sum, never the individual readings. All ciphertext math is exact
//! modular arithmetic on `BigUint`; fixed-width integers are never used here.

use crate::CryptoError;
use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, ToPrimitive, Zero};
use rand::RngCore;

/// Miller-Rabin rounds. 2^-128 error bound for the key sizes used here.
const MILLER_RABIN_ROUNDS: usize = 64;

/// Public half of a Paillier key pair: modulus `n` and base `g = n + 1`.
#[derive(Clone, PartialEq, Eq)]
pub struct PaillierPublicKey {
    n: BigUint,
    g: BigUint,
    /// Cached n^2, the ciphertext modulus.
    nn: BigUint,
}

/// Private half: Carmichael value `lambda = lcm(p-1, q-1)` and
/// `mu = L(g^lambda mod n^2)^-1 mod n`.
#[derive(Clone)]
pub struct PaillierPrivateKey {
    lambda: BigUint,
    mu: BigUint,
    public: PaillierPublicKey,
}

impl PaillierPublicKey {
    pub fn n(&self) -> &BigUint {
        &self.n
    }

    /// Bit length of the modulus.
    pub fn bits(&self) -> u64 {
        self.n.bits()
    }

    /// Encrypt a non-negative integer below `n`: `c = g^m * r^n mod n^2`
    /// with a fresh random unit `r`.
    pub fn encrypt(&self, m: &BigUint, rng: &mut impl RngCore) -> Result<BigUint, CryptoError> {
        if m >= &self.n {
            return Err(CryptoError::PlaintextRange);
        }

        let one = BigUint::one();
        let r = loop {
            let r = rng.gen_biguint_range(&one, &self.n);
            if r.gcd(&self.n).is_one() {
                break r;
            }
        };

        let gm = self.g.modpow(m, &self.nn);
        let rn = r.modpow(&self.n, &self.nn);
        Ok((gm * rn) % &self.nn)
    }

    /// Homomorphic combination: multiplication mod n^2 adds the plaintexts.
    pub fn combine(&self, c1: &BigUint, c2: &BigUint) -> BigUint {
        (c1 * c2) % &self.nn
    }

    /// Hex encoding of `(n, g)`, the wire shape of a published key.
    pub fn to_hex(&self) -> (String, String) {
        (format!("{:x}", self.n), format!("{:x}", self.g))
    }

    pub fn from_hex(n_hex: &str, g_hex: &str) -> Result<Self, CryptoError> {
        let n = BigUint::parse_bytes(n_hex.as_bytes(), 16)
            .ok_or_else(|| CryptoError::InvalidKey("modulus is not hex".into()))?;
        let g = BigUint::parse_bytes(g_hex.as_bytes(), 16)
            .ok_or_else(|| CryptoError::InvalidKey("base is not hex".into()))?;
        if n.is_zero() {
            return Err(CryptoError::InvalidKey("zero modulus".into()));
        }
        let nn = &n * &n;
        Ok(Self { n, g, nn })
    }
}

impl std::fmt::Debug for PaillierPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaillierPublicKey")
            .field("modulus_bits", &self.n.bits())
            .finish()
    }
}

impl PaillierPrivateKey {
    pub fn public(&self) -> &PaillierPublicKey {
        &self.public
    }

    /// Decrypt: `m = L(c^lambda mod n^2) * mu mod n`.
    pub fn decrypt(&self, c: &BigUint) -> Result<BigUint, CryptoError> {
        if c.is_zero() || c >= &self.public.nn {
            return Err(CryptoError::InvalidCiphertext(
                "ciphertext out of range".into(),
            ));
        }

        let u = c.modpow(&self.lambda, &self.public.nn);
        let l = l_function(&u, &self.public.n);
        Ok((l * &self.mu) % &self.public.n)
    }

    /// Decrypt and narrow to `u64`. Fails if the sum overflows, which callers
    /// report as an unavailable metric rather than a wrong number.
    pub fn decrypt_u64(&self, c: &BigUint) -> Result<u64, CryptoError> {
        let m = self.decrypt(c)?;
        m.to_u64()
            .ok_or_else(|| CryptoError::InvalidCiphertext("plaintext exceeds u64".into()))
    }
}

// Private keys never appear in logs.
impl std::fmt::Debug for PaillierPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaillierPrivateKey")
            .field("modulus_bits", &self.public.n.bits())
            .finish()
    }
}

/// `L(u) = (u - 1) / n`, exact division by construction of its inputs.
fn l_function(u: &BigUint, n: &BigUint) -> BigUint {
    (u - BigUint::one()) / n
}

/// Generate a Paillier key pair with a modulus of roughly `bits` bits.
///
/// `p` and `q` are random probable primes of `bits / 2`, `g = n + 1` (which
/// makes `L(g^lambda mod n^2) = lambda mod n` and keeps encryption to two
/// modular exponentiations).
pub fn generate_keys(
    bits: u64,
    rng: &mut impl RngCore,
) -> Result<(PaillierPublicKey, PaillierPrivateKey), CryptoError> {
    if bits < 64 {
        return Err(CryptoError::KeyGeneration(format!(
            "modulus of {bits} bits is below the 64-bit floor"
        )));
    }

    let half = bits / 2;
    let p = generate_prime(half, rng);
    let q = loop {
        let q = generate_prime(half, rng);
        if q != p {
            break q;
        }
    };

    let n = &p * &q;
    let nn = &n * &n;
    let g = &n + BigUint::one();

    let one = BigUint::one();
    let lambda = (&p - &one).lcm(&(&q - &one));

    let u = g.modpow(&lambda, &nn);
    let mu = l_function(&u, &n)
        .modinv(&n)
        .ok_or_else(|| CryptoError::KeyGeneration("lambda is not invertible mod n".into()))?;

    let public = PaillierPublicKey { n, g, nn };
    let private = PaillierPrivateKey {
        lambda,
        mu,
        public: public.clone(),
    };
    Ok((public, private))
}

/// Random probable prime of exactly `bits` bits.
fn generate_prime(bits: u64, rng: &mut impl RngCore) -> BigUint {
    let small_primes = sieve(1000);
    let one = BigUint::one();

    loop {
        let mut candidate = rng.gen_biguint(bits);
        // Force full bit length and oddness.
        candidate.set_bit(bits - 1, true);
        candidate.set_bit(0, true);

        if small_primes
            .iter()
            .any(|sp| (&candidate % *sp).is_zero() && candidate != BigUint::from(*sp))
        {
            continue;
        }
        if candidate <= one {
            continue;
        }
        if is_probable_prime(&candidate, rng) {
            return candidate;
        }
    }
}

/// Primes below `limit`, by sieve of Eratosthenes.
fn sieve(limit: usize) -> Vec<u64> {
    let mut composite = vec![false; limit];
    let mut primes = Vec::new();
    for i in 2..limit {
        if !composite[i] {
            primes.push(i as u64);
            let mut j = i * i;
            while j < limit {
                composite[j] = true;
                j += i;
            }
        }
    }
    primes
}

/// Miller-Rabin with random bases.
fn is_probable_prime(n: &BigUint, rng: &mut impl RngCore) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u32);
    let three = BigUint::from(3u32);

    if *n == two || *n == three {
        return true;
    }
    if n < &two || (n % &two).is_zero() {
        return false;
    }

    let n_minus_one = n - &one;
    let mut d = n_minus_one.clone();
    let mut s = 0u64;
    while (&d % &two).is_zero() {
        d >>= 1;
        s += 1;
    }

    'witness: for _ in 0..MILLER_RABIN_ROUNDS {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 0..s - 1 {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}
