//! Key images: `I = x·Hp(P)`.

use crate::hash::hash_to_point;
use crate::keys::to_scalar;
use umbra_types::{KeyImage, PublicKey, SecretKey};

pub fn generate_key_image(public: &PublicKey, secret: &SecretKey) -> KeyImage {
    let point = to_scalar(secret) * hash_to_point(&public.0);
    KeyImage(point.compress().to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keys;
    use crate::random::rng_from_seed;

    #[test]
    fn key_image_is_deterministic_per_key() {
        let mut rng = rng_from_seed(3);
        let a = generate_keys(&mut rng);
        let b = generate_keys(&mut rng);
        assert_eq!(
            generate_key_image(&a.public, &a.secret),
            generate_key_image(&a.public, &a.secret)
        );
        assert_ne!(
            generate_key_image(&a.public, &a.secret),
            generate_key_image(&b.public, &b.secret)
        );
    }
}
