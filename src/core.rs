use std::any::Any;
use std::hash::Hash;
use std::sync::Arc;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// A value that can flow through the pipeline.
///
/// Items are compared structurally: two snapshots holding equal items in the
/// same order are equal, no matter where the items were allocated. The hash
/// is what feeds the [`Hash32`] fingerprint of a snapshot.
pub trait Item: Clone + Eq + Hash + Send + Sync + 'static {}

impl<T> Item for T where T: Clone + Eq + Hash + Send + Sync + 'static {}

/// An [`Item`] usable as a map key. Ordering keeps keyed and grouped maps
/// deterministic.
pub trait Key: Item + Ord {}

impl<T> Key for T where T: Item + Ord {}

/// Any stage output the engine can cache and compare.
pub trait Value: Any + Send + Sync + PartialEq + Hash {}

impl<T> Value for T where T: Any + Send + Sync + PartialEq + Hash {}

/// A 32-byte BLAKE3 hash used for change detection.
///
/// Every cached stage output carries one. When a stage is recomputed, the new
/// fingerprint is compared against the old one before the outputs themselves
/// are compared, so unchanged results are recognized cheaply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    /// Structural fingerprint of any hashable value.
    pub fn of<T: Hash + ?Sized>(value: &T) -> Self {
        let mut hasher = Blake3Hasher::default();
        value.hash(&mut hasher);
        hasher.into()
    }

    pub fn to_hex(self) -> String {
        crate::utils::hex(&self.0)
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Global data available to every task while a session is running.
///
/// # Type Parameters
///
/// * `G`: The type of the user-defined global data. Must be `Send + Sync`.
#[derive(Clone)]
pub struct Environment<G: Send + Sync = ()> {
    /// The name of the generator, used in logs.
    pub generator: &'static str,
    /// User-defined global data.
    pub data: G,
}

impl<G: Send + Sync> Environment<G> {
    pub fn new(generator: &'static str, data: G) -> Self {
        Self { generator, data }
    }
}

impl Default for Environment<()> {
    fn default() -> Self {
        Self {
            generator: env!("CARGO_PKG_NAME"),
            data: (),
        }
    }
}

impl<G: Send + Sync> std::fmt::Debug for Environment<G>
where
    G: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("generator", &self.generator)
            .field("data", &self.data)
            .finish()
    }
}
