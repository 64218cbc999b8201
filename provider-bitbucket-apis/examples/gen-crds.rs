use kube::CustomResourceExt;
use provider_bitbucket_apis::{ProviderConfig, ProviderConfigUsage, Repo, RepoPermissionUser};

pub fn main() {
    let crds = [
        ProviderConfig::crd(),
        ProviderConfigUsage::crd(),
        Repo::crd(),
        RepoPermissionUser::crd(),
    ];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd).unwrap());
    }
}
