use proptest::prelude::*;

use umbra_crypto::{
    check_ring_signature, decrypt_amount, encrypt_amount, generate_key_image, generate_keys,
    generate_ring_signature, random_scalar, rng_from_seed,
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// A signature by any ring member verifies and carries that member's key image.
    #[test]
    fn ring_signature_verifies(seed in any::<u64>(), size in 1usize..8, pick in any::<usize>()) {
        let mut rng = rng_from_seed(seed);
        let keys: Vec<_> = (0..size).map(|_| generate_keys(&mut rng)).collect();
        let ring: Vec<_> = keys.iter().map(|k| k.public).collect();
        let real = pick % size;
        let image = generate_key_image(&ring[real], &keys[real].secret);
        let msg = [seed as u8; 32];
        let sig = generate_ring_signature(&msg, &ring, &image, &keys[real].secret, real, &mut rng).unwrap();
        prop_assert!(check_ring_signature(&msg, &ring, &image, &sig));
    }

    /// Amount encryption is an involution under the same shared secret.
    #[test]
    fn amount_encryption_inverts(seed in any::<u64>(), amount in any::<u64>()) {
        let mut rng = rng_from_seed(seed);
        let shared = random_scalar(&mut rng);
        prop_assert_eq!(decrypt_amount(&encrypt_amount(amount, &shared), &shared), amount);
    }
}
