use std::fmt::Debug;

use proptest::{
    arbitrary::{any, Arbitrary},
    prop_assert_eq, proptest,
    strategy::Strategy,
    test_runner::Config,
};
use serde::{de::DeserializeOwned, Serialize};

/// Quickly create a JSON string roundtrip proptest.
///
/// ```ignore
/// json_string_roundtrip_proptest::<TimestampMs>();
/// ```
pub fn json_string_roundtrip_proptest<T>()
where
    T: Arbitrary + PartialEq + Serialize + DeserializeOwned + Debug,
{
    proptest!(|(value1: T)| {
        let json1 = serde_json::to_string(&value1).unwrap();
        let value2 = serde_json::from_str::<T>(&json1).unwrap();
        let json2 = serde_json::to_string(&value2).unwrap();
        prop_assert_eq!(&value1, &value2);
        // Serialized form should be canonical too
        prop_assert_eq!(&json1, &json2);
    });
}

/// Quickly create a [`serde_json::Value`] canonical roundtrip proptest.
/// Useful for dictionary-like types that serialize to/from a JSON object,
/// since the `Value` comparison is field-order invariant.
pub fn json_value_canonical_proptest<T>()
where
    T: Arbitrary + PartialEq + Serialize + DeserializeOwned + Debug,
{
    json_value_custom(any::<T>(), Config::default());
}

/// Create a [`serde_json::Value`] canonical roundtrip proptest using a
/// custom strategy and custom proptest [`Config`]. Useful for testing
/// foreign types for which we cannot implement [`Arbitrary`], or reducing
/// the number of iterations on proptests that would otherwise take too long.
pub fn json_value_custom<S, T>(strategy: S, config: Config)
where
    S: Strategy<Value = T>,
    T: PartialEq + Serialize + DeserializeOwned + Debug,
{
    proptest!(config, |(value1 in strategy)| {
        let json_value1 = serde_json::to_value(&value1).unwrap();
        let value2 = serde_json::from_value::<T>(json_value1.clone()).unwrap();
        let json_value2 = serde_json::to_value(&value2).unwrap();

        prop_assert_eq!(&value1, &value2);
        prop_assert_eq!(&json_value1, &json_value2);
    });
}
