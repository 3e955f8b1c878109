use metrics_operator_apis::crds;
use serde_yaml;

pub fn main() {
    for crd in crds().unwrap() {
        println!("---\n{}", serde_yaml::to_string(&crd).unwrap());
    }
}
