tonic::include_proto!("siderolink");
