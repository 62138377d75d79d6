use kube::CustomResourceExt;

fn main() {
    let resources = [attach_operator::requests::NetworkAttachmentDefinition::crd()];

    for resource in resources {
        println!("---");
        print!("{}", serde_yaml::to_string(&resource).unwrap());
    }
}
