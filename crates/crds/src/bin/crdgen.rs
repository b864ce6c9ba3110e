//! Prints the Manifest CRD as YAML.
//!
//! ```sh
//! cargo run -p crds --bin crdgen > manifest-crd.yaml
//! ```

use crds::Manifest;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Manifest::crd())?);
    Ok(())
}
