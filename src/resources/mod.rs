pub mod apiexports;
pub mod apiresourceimports;
pub mod apiresourceschemas;
pub mod synctargets;
