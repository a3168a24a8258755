use kube::CustomResourceExt;
use synctarget_export_controller::resources::{
    apiexports::ApiExport, apiresourceimports::ApiResourceImport,
    apiresourceschemas::ApiResourceSchema, synctargets::SyncTarget,
};

fn main() -> anyhow::Result<()> {
    let crds = [
        SyncTarget::crd(),
        ApiExport::crd(),
        ApiResourceSchema::crd(),
        ApiResourceImport::crd(),
    ];
    for (i, crd) in crds.iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
